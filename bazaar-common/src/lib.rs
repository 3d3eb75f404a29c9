pub mod auth;
pub mod config;
pub mod metrics;
pub mod model;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Messages safe to return to API clients, as opposed to the full `Display`
/// output which may carry connection strings, file paths or other internals.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
