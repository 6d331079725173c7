/// Configuration macros for config definitions with embedded defaults
///
/// `config_struct!` declares a struct, its `Default` impl and serde support
/// (`#[serde(default)]`) from one field list, so a partially filled TOML file
/// falls back to the declared defaults field by field. `FIELDS` lists the
/// accepted keys so the loader can warn about typos instead of silently
/// ignoring them.
///
/// ```ignore
/// config_struct! {
///     pub struct SchedulerConfig {
///         interval_secs: u64 = 60,
///         lock_stale_after_secs: u64 = 600,
///     }
/// }
/// ```
#[macro_export]
macro_rules! config_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_name:ident: $field_type:ty = $default_value:expr
            ),*
            $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field_name: $field_type,
            )*
        }

        impl $name {
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field_name)),*];
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field_name: $default_value,
                    )*
                }
            }
        }
    };
}
