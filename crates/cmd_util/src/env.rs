use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::EnvFilter;

/// Read a knob from the environment, falling back to `default` when the
/// variable is unset or does not parse.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    match T::from_str(&var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Log to the test writer. Safe to call from every test.
pub fn config_test() {
    // Try to initialize tracing_subcriber. Ok if it fails - probably
    // means it was initialized already.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::{
        config_test,
        env_config,
    };

    #[test]
    fn config_test_can_run_repeatedly() {
        config_test();
        config_test();
        tracing::info!("test logging is installed");
    }

    #[test]
    fn env_config_falls_back_on_missing_or_invalid() {
        assert_eq!(env_config("CMD_UTIL_TEST_UNSET_KNOB", 17usize), 17);

        std::env::set_var("CMD_UTIL_TEST_BAD_KNOB", "not-a-number");
        assert_eq!(env_config("CMD_UTIL_TEST_BAD_KNOB", 3u64), 3);

        std::env::set_var("CMD_UTIL_TEST_GOOD_KNOB", "42");
        assert_eq!(env_config("CMD_UTIL_TEST_GOOD_KNOB", 3u64), 42);
    }
}
