//! Historical file naming for spectroscopy output.
//!
//! Files are named `{basename}_{p|m}{|step|}{gr|exc|_}{set}` so existing
//! analysis scripts keep working.

use crate::data::transform::MeasurementMode;
use crate::experiment::events::ShutterState;

/// Build the file name for one acquisition.
///
/// - prefix `p` for positive delays, `m` for negative ones; a zero delay gets
///   `m` when the shutter is open or the mode is TA, no prefix otherwise
/// - the delay is truncated toward zero
/// - FSRS spectra are tagged `gr`/`exc` by shutter state, every other mode
///   uses `_`
///
/// ```rust
/// use fsrs_daq::data::{naming::format_fsrs_filename, transform::MeasurementMode};
/// use fsrs_daq::experiment::events::ShutterState;
///
/// assert_eq!(
///     format_fsrs_filename(MeasurementMode::Fsrs, "run", 150.4, 2, ShutterState::Closed),
///     "run_p150gr2"
/// );
/// ```
pub fn format_fsrs_filename(
    mode: MeasurementMode,
    basename: &str,
    step: f64,
    set: usize,
    shutter: ShutterState,
) -> String {
    let mut name = format!("{basename}_");

    if step > 0.0 {
        name.push('p');
    } else if step < 0.0
        || shutter.is_open()
        || mode == MeasurementMode::TransientAbsorption
    {
        name.push('m');
    }

    name.push_str(&(step.trunc().abs() as i64).to_string());

    match (mode, shutter) {
        (MeasurementMode::Fsrs, ShutterState::Closed) => name.push_str("gr"),
        (MeasurementMode::Fsrs, ShutterState::Open) => name.push_str("exc"),
        _ => name.push('_'),
    }

    name.push_str(&set.to_string());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_historical_names() {
        assert_eq!(
            format_fsrs_filename(MeasurementMode::Fsrs, "run", 150.4, 2, ShutterState::Closed),
            "run_p150gr2"
        );
        assert_eq!(
            format_fsrs_filename(MeasurementMode::Fsrs, "run", -150.4, 2, ShutterState::Open),
            "run_m150exc2"
        );
        assert_eq!(
            format_fsrs_filename(
                MeasurementMode::TransientAbsorption,
                "run",
                0.0,
                0,
                ShutterState::Open
            ),
            "run_m0_0"
        );
    }

    #[test]
    fn test_zero_delay_ground_state_has_no_prefix() {
        assert_eq!(
            format_fsrs_filename(MeasurementMode::Fsrs, "run", 0.0, 1, ShutterState::Closed),
            "run_0gr1"
        );
        assert_eq!(
            format_fsrs_filename(
                MeasurementMode::Transmittance,
                "run",
                0.0,
                3,
                ShutterState::Closed
            ),
            "run_0_3"
        );
    }

    #[test]
    fn test_fraction_below_one_truncates_to_zero() {
        assert_eq!(
            format_fsrs_filename(MeasurementMode::Fsrs, "x", -0.7, 0, ShutterState::Open),
            "x_m0exc0"
        );
    }
}
