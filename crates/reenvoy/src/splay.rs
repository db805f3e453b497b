use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static SPLAY_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn rng() -> &'static Mutex<StdRng> {
	SPLAY_RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Uniform random delay in `[0, max)`, or zero when `max` is zero.
///
/// All handles in the process draw from one entropy-seeded source so that
/// simultaneous kills spread out instead of landing together.
pub fn random_splay(max: Duration) -> Duration {
	let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
	if nanos == 0 {
		return Duration::ZERO;
	}
	let mut rng = rng().lock().unwrap_or_else(|p| p.into_inner());
	Duration::from_nanos(rng.gen_range(0..nanos))
}
