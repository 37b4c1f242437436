use std::time::SystemTime;

use crate::codec::DataType;

pub type AxisId = u16;

/// One logged channel: a name, the path of whatever produced it (for display),
/// and its decoded samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub logged_element_path: Option<String>,
    pub values: Vec<f64>,
}

impl Series {
    pub fn new(name: impl Into<String>, logged_element_path: Option<String>, values: Vec<f64>) -> Self {
        Self { name: name.into(), logged_element_path, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A completed capture, ready to hand off to storage. `y_data` pairs each
/// series with the axis it is plotted against.
#[derive(Debug, Clone)]
pub struct DataloggingAcquisition {
    pub reference_id: String,
    pub firmware_id: String,
    pub captured_at: SystemTime,
    pub name: Option<String>,
    pub x_data: Series,
    y_data: Vec<(Series, AxisId)>,
    axis_names: std::collections::HashMap<AxisId, String>,
    pub trigger_index: Option<usize>,
}

impl DataloggingAcquisition {
    pub fn new(firmware_id: impl Into<String>, reference_id: String, captured_at: SystemTime, name: Option<String>, x_data: Series) -> Self {
        Self {
            reference_id,
            firmware_id: firmware_id.into(),
            captured_at,
            name,
            x_data,
            y_data: Vec::new(),
            axis_names: std::collections::HashMap::new(),
            trigger_index: None,
        }
    }

    /// Adds a y-series. Rejects a length mismatch against `x_data`, or an
    /// `axis_id` already bound to a different axis name.
    pub fn add_y_series(&mut self, series: Series, axis_id: AxisId, axis_name: impl Into<String>) -> Result<(), String> {
        if series.len() != self.x_data.len() {
            return Err(format!(
                "y-series '{}' has {} points, expected {} to match the x-axis",
                series.name,
                series.len(),
                self.x_data.len()
            ));
        }
        let axis_name = axis_name.into();
        if let Some(existing) = self.axis_names.get(&axis_id) {
            if *existing != axis_name {
                return Err(format!(
                    "axis id {axis_id} already bound to '{existing}', cannot rebind to '{axis_name}'"
                ));
            }
        } else {
            self.axis_names.insert(axis_id, axis_name);
        }
        self.y_data.push((series, axis_id));
        Ok(())
    }

    pub fn set_trigger_index(&mut self, index: Option<usize>) -> Result<(), String> {
        if let Some(i) = index {
            if i >= self.x_data.len() {
                return Err(format!("trigger index {i} out of bounds for x-axis of length {}", self.x_data.len()));
            }
        }
        self.trigger_index = index;
        Ok(())
    }

    pub fn y_data(&self) -> &[(Series, AxisId)] {
        &self.y_data
    }
}

/// Which signal supplies the x-axis: the device's free-running sample clock,
/// or one of the logged signals itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XAxisSource {
    MeasuredTime,
    Signal(usize),
}

/// One channel in an acquisition request, as accepted by `request_acquisition`.
#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub name: String,
    pub logged_element_path: Option<String>,
    pub data_type: DataType,
    pub axis_id: AxisId,
    pub axis_name: String,
}

/// A fully-formed acquisition request. `wire_payload` is the pre-encoded
/// `ConfigureDatalog` body (trigger condition, decimation, sampling rate,
/// buffer layout) — this subsystem treats it as opaque and only inspects
/// `signals`/`x_axis` to validate and to deinterleave the result.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub signals: Vec<SignalSpec>,
    pub x_axis: XAxisSource,
    pub wire_payload: Vec<u8>,
}

impl AcquisitionConfig {
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }
}

/// Deinterleaves a raw acquisition buffer into per-signal series. Samples are
/// stored sample-major: every sample contributes one fixed-width record
/// containing each signal's bytes back to back, in `config.signals` order.
/// When the x-axis is `MeasuredTime` a leading 4-byte (u32, big-endian) time
/// counter precedes each record.
pub fn deinterleave(data: &[u8], config: &AcquisitionConfig) -> Result<(Series, Vec<Series>), String> {
    let time_width = match config.x_axis {
        XAxisSource::MeasuredTime => 4,
        XAxisSource::Signal(_) => 0,
    };
    let record_width: usize = time_width + config.signals.iter().map(|s| s.data_type.byte_size()).sum::<usize>();
    if record_width == 0 {
        return Err("acquisition config has no signals".to_string());
    }
    if data.len() % record_width != 0 {
        return Err(format!(
            "acquisition data length {} is not a multiple of the record width {record_width}",
            data.len()
        ));
    }
    let num_samples = data.len() / record_width;

    let mut x_values = Vec::with_capacity(num_samples);
    let mut y_values: Vec<Vec<f64>> = vec![Vec::with_capacity(num_samples); config.signals.len()];

    for sample in data.chunks_exact(record_width) {
        let mut cursor = 0usize;
        if time_width > 0 {
            let t = u32::from_be_bytes(sample[0..4].try_into().map_err(|_| "truncated time field".to_string())?);
            x_values.push(t as f64);
            cursor += time_width;
        }
        for (i, signal) in config.signals.iter().enumerate() {
            let width = signal.data_type.byte_size();
            let raw = &sample[cursor..cursor + width];
            let value = crate::codec::decode_numeric(raw, signal.data_type, crate::codec::Endianness::Big);
            y_values[i].push(value);
            cursor += width;
        }
    }

    if let XAxisSource::Signal(idx) = config.x_axis {
        x_values = y_values[idx].clone();
    }

    let x_name = match config.x_axis {
        XAxisSource::MeasuredTime => "measured_time".to_string(),
        XAxisSource::Signal(idx) => config.signals[idx].name.clone(),
    };
    let x_series = Series::new(x_name, None, x_values);

    let y_series = config
        .signals
        .iter()
        .zip(y_values.into_iter())
        .map(|(spec, values)| Series::new(spec.name.clone(), spec.logged_element_path.clone(), values))
        .collect();

    Ok((x_series, y_series))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, data_type: DataType, axis_id: AxisId) -> SignalSpec {
        SignalSpec { name: name.to_string(), logged_element_path: None, data_type, axis_id, axis_name: "A".to_string() }
    }

    #[test]
    fn rejects_y_series_length_mismatch() {
        let mut acq = DataloggingAcquisition::new("fw", "ref".to_string(), SystemTime::UNIX_EPOCH, None, Series::new("t", None, vec![0.0, 1.0]));
        let bad = Series::new("sig", None, vec![0.0]);
        assert!(acq.add_y_series(bad, 0, "A").is_err());
    }

    #[test]
    fn rejects_axis_id_rebinding() {
        let mut acq = DataloggingAcquisition::new("fw", "ref".to_string(), SystemTime::UNIX_EPOCH, None, Series::new("t", None, vec![0.0, 1.0]));
        acq.add_y_series(Series::new("a", None, vec![0.0, 1.0]), 0, "Volts").unwrap();
        let result = acq.add_y_series(Series::new("b", None, vec![0.0, 1.0]), 0, "Amps");
        assert!(result.is_err());
    }

    #[test]
    fn deinterleaves_measured_time_and_two_signals() {
        let config = AcquisitionConfig {
            signals: vec![spec("a", DataType::U16, 0), spec("b", DataType::U8, 0)],
            x_axis: XAxisSource::MeasuredTime,
            wire_payload: Vec::new(),
        };
        // record width = 4 (time) + 2 (u16) + 1 (u8) = 7
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&10u16.to_be_bytes());
        data.push(1);
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&20u16.to_be_bytes());
        data.push(2);

        let (x, ys) = deinterleave(&data, &config).unwrap();
        assert_eq!(x.values, vec![0.0, 100.0]);
        assert_eq!(ys[0].values, vec![10.0, 20.0]);
        assert_eq!(ys[1].values, vec![1.0, 2.0]);
    }
}
