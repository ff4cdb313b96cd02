//! Scan averaging and boxcar smoothing.

use tracing::{debug, error};

use super::{ScanSource, SpectralSample};
use crate::error::{DeviceError, DeviceResult};

/// Acquire `scan_average` scans one after another and reduce them to one
/// spectrum, then apply a boxcar of half-width `boxcar_half_width`.
///
/// With `scan_average == 1` the single scan is returned untouched by the
/// averaging step. Any failed scan aborts the whole run with that scan's
/// error; partial averages are never returned.
pub async fn run<S>(
    source: &S,
    scan_average: u32,
    boxcar_half_width: usize,
) -> DeviceResult<Vec<SpectralSample>>
where
    S: ScanSource + ?Sized,
{
    if scan_average == 0 {
        return Err(DeviceError::validation("scan average must be at least 1"));
    }

    let mut scans = Vec::with_capacity(scan_average as usize);
    for index in 0..scan_average {
        match source.scan().await {
            Ok(samples) => {
                debug!(scan = index + 1, of = scan_average, points = samples.len(), "Scan complete");
                scans.push(samples);
            }
            Err(err) => {
                error!(scan = index + 1, of = scan_average, error = %err, "Averaged capture aborted");
                return Err(err);
            }
        }
    }

    let averaged = mean_of(scans)?;
    Ok(boxcar_smooth(&averaged, boxcar_half_width))
}

/// Index-wise mean of equal-length scans.
fn mean_of(mut scans: Vec<Vec<SpectralSample>>) -> DeviceResult<Vec<SpectralSample>> {
    if scans.len() == 1 {
        return Ok(scans.remove(0));
    }

    let expected = scans.first().map_or(0, Vec::len);
    if let Some(bad) = scans.iter().find(|scan| scan.len() != expected) {
        return Err(DeviceError::protocol(
            "scan average",
            format!("scan of {} points does not match {} points", bad.len(), expected),
        ));
    }

    let count = scans.len() as f64;
    let averaged = (0..expected)
        .map(|i| SpectralSample {
            wavelength: scans[0][i].wavelength,
            measured_value: scans.iter().map(|scan| scan[i].measured_value).sum::<f64>() / count,
        })
        .collect();
    Ok(averaged)
}

/// Symmetric moving average of half-width `w`.
///
/// Points closer than `w` to either end keep their input value. `w == 0`,
/// or a spectrum shorter than one full window, returns the input unchanged.
pub fn boxcar_smooth(samples: &[SpectralSample], w: usize) -> Vec<SpectralSample> {
    let mut smoothed = samples.to_vec();
    let window = 2 * w + 1;
    if w == 0 || samples.len() < window {
        return smoothed;
    }

    for i in w..samples.len() - w {
        let sum: f64 = samples[i - w..=i + w]
            .iter()
            .map(|sample| sample.measured_value)
            .sum();
        smoothed[i].measured_value = sum / window as f64;
    }
    smoothed
}
