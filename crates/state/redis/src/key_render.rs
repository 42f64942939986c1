use domo_state::RateKey;

/// Render a [`RateKey`] into a Redis key string with the given prefix.
///
/// The format is `prefix:rate:scope:identity`.
pub fn render_key(prefix: &str, key: &RateKey) -> String {
    format!("{}:rate:{}:{}", prefix, key.scope, key.identity)
}
