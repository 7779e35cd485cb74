use std::env;
use std::sync::OnceLock;

static OPTIMIZE_LAYOUT: OnceLock<Option<bool>> = OnceLock::new();
static PARALLEL_BUILD: OnceLock<Option<bool>> = OnceLock::new();
static BUILD_THREADS: OnceLock<Option<usize>> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

fn read_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn optimize_layout() -> Option<bool> {
    *OPTIMIZE_LAYOUT.get_or_init(|| read_var("TENSORSEL_OPTIMIZE_LAYOUT").map(|v| parse_bool(&v)))
}

pub(crate) fn parallel_build() -> Option<bool> {
    *PARALLEL_BUILD.get_or_init(|| read_var("TENSORSEL_PARALLEL_BUILD").map(|v| parse_bool(&v)))
}

pub(crate) fn build_threads() -> Option<usize> {
    *BUILD_THREADS.get_or_init(|| {
        let value = read_var("TENSORSEL_BUILD_THREADS")?;
        let parsed = parse_usize(&value);
        if parsed.is_none() {
            log::warn!("ignoring TENSORSEL_BUILD_THREADS={value:?}: not a thread count");
        }
        parsed
    })
}
