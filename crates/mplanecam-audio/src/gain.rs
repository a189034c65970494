//! Linear gain with saturation.

/// Multiplies every sample by `gain`, clamping to the signed 16-bit range instead of wrapping.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = f32::from(*sample) * gain;
        *sample = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}
