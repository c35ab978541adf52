//! Configuration parameters struct parsing helper.

use std::path::Path;

use crate::utils::SplitfsError;

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(SplitfsError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; rpc_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::SplitfsError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::SplitfsError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

/// Resolves the TOML text to feed into `parsed_config!`: an inline string
/// from the command line wins (every '+' treated as newline), then a config
/// file if one is given, otherwise `None`.
pub fn config_text(
    inline: &str,
    file: Option<&Path>,
) -> Result<Option<String>, SplitfsError> {
    if !inline.is_empty() {
        Ok(Some(inline.replace('+', "\n")))
    } else if let Some(path) = file {
        Ok(Some(std::fs::read_to_string(path)?))
    } else {
        Ok(None)
    }
}
