use ::config::Config;
use std::time::Duration;

// Config lookups resolve `{name}.{key}` before falling back to the bare key,
// so a named server instance can override process-wide defaults.

pub(crate) fn get_namespaced_usize(config: &Config, name: &str, key: &str) -> Option<usize> {
    if !name.is_empty() {
        if let Ok(value) = config.get::<usize>(&format!("{name}.{key}")) {
            return Some(value);
        }
    }
    config.get::<usize>(key).ok()
}

// Duration keys are expressed in milliseconds.
pub(crate) fn get_namespaced_duration_ms(
    config: &Config,
    name: &str,
    key: &str,
) -> Option<Duration> {
    if !name.is_empty() {
        if let Ok(millis) = config.get::<u64>(&format!("{name}.{key}")) {
            return Some(Duration::from_millis(millis));
        }
    }
    config.get::<u64>(key).ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::builder()
            .set_default("poll_capacity", 64)
            .unwrap()
            .set_default("gateway.poll_capacity", 8)
            .unwrap()
            .set_default("idle_timeout_ms", 1500)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn namespaced_key_overrides_bare_key() {
        let config = config();
        assert_eq!(
            get_namespaced_usize(&config, "gateway", "poll_capacity"),
            Some(8)
        );
        assert_eq!(
            get_namespaced_usize(&config, "chat", "poll_capacity"),
            Some(64)
        );
        assert_eq!(get_namespaced_usize(&config, "", "poll_capacity"), Some(64));
    }

    #[test]
    fn missing_key_is_none() {
        let config = config();
        assert_eq!(get_namespaced_usize(&config, "gateway", "num_loops"), None);
    }

    #[test]
    fn duration_keys_are_milliseconds() {
        let config = config();
        assert_eq!(
            get_namespaced_duration_ms(&config, "", "idle_timeout_ms"),
            Some(Duration::from_millis(1500))
        );
    }
}
