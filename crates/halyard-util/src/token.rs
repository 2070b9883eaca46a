use rand::distributions::Alphanumeric;
use rand::Rng;

/// Mint an opaque account token. Tokens are bearer credentials validated
/// against the data layer; they carry no structure of their own.
pub fn generate(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
