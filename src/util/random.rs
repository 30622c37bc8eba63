use rand::{Rng, RngCore};


/// Source of randomness for fault injection, abstracted so tests can decide exactly which
///  packets get dropped, corrupted or delayed
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    /// uniformly distributed in `[0.0, 1.0)`
    fn gen_f64(&self) -> f64;
    fn fill_bytes(&self, buf: &mut [u8]);
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf)
    }
}
