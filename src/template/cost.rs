//! Pure cost estimation for one template under an account subscription.
//!
//! The result gates the execution engine's retry policy, so the arithmetic
//! here must stay bit-for-bit stable: integer result, `f64` intermediates,
//! ceilings applied in the exact order below.
use super::GenerationTemplate;

const K1: f64 = 2.951823174884865e-21;
const K2: f64 = 5.753298233447344e-7;

/// Smallest billable pixel count; anything smaller is rounded up to this.
const MIN_IMAGE_SIZE: f64 = 65_536.0;
/// Upper bounds of the high-tier free generation allowance.
const FREE_MAX_IMAGE_SIZE: f64 = 1_048_576.0;
const FREE_MAX_STEPS: u8 = 28;
const FREE_MIN_TIER: i64 = 3;

/// Units the service will charge for one run of `template`.
///
/// High-tier active subscriptions generate small-enough, short-enough
/// requests for free: the batch contribution is zeroed, which zeroes the
/// estimate without changing how many tasks actually execute.
pub fn estimate_cost(template: &GenerationTemplate, tier: i64, active: bool) -> i64 {
    let image_size = (template.width as f64 * template.height as f64).max(MIN_IMAGE_SIZE);

    let free_batch = active
        && tier >= FREE_MIN_TIER
        && template.steps <= FREE_MAX_STEPS
        && image_size <= FREE_MAX_IMAGE_SIZE;
    let batch = if free_batch { 0 } else { template.batch_size as i64 };

    let v = if template.model.is_flagship() {
        let multiplier = if template.smea_dyn {
            1.4
        } else if template.smea {
            1.2
        } else {
            1.0
        };
        (K1 * image_size + K2 * image_size * template.steps as f64).ceil() * multiplier
    } else {
        0.0
    };

    let mut per_image = (v.ceil() as i64).max(2);
    if template.uncond_scale != 1.0 {
        per_image = (1.3 * per_image as f64).ceil() as i64;
    }
    per_image * batch
}
