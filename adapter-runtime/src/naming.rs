//! Artifact name templates
//!
//! | Placeholder   | Value                          |
//! |---------------|--------------------------------|
//! | `${timestamp}`| epoch milliseconds             |
//! | `${datetime}` | `yyyyMMdd_HHmmss` (local time) |
//! | `${date}`     | `yyyyMMdd`                     |
//! | `${time}`     | `HHmmss`                       |
//! | `${batch}`    | batch sequence number          |
//! | `${uuid}`     | random UUID v4                 |
//! | `${<header>}` | payload header value           |
//!
//! Unknown placeholders are left as they are.

use crate::result::Metadata;
use chrono::{DateTime, Local};
use serde_json::Value;

/// Values available to a template
#[derive(Debug, Clone)]
pub struct NamingContext<'a> {
    /// Render time
    pub now: DateTime<Local>,
    /// Batch sequence, for batch units
    pub sequence: Option<u64>,
    /// Payload headers
    pub headers: Option<&'a Metadata>,
}

impl<'a> NamingContext<'a> {
    /// Context at the current time
    pub fn now() -> Self {
        Self {
            now: Local::now(),
            sequence: None,
            headers: None,
        }
    }

    /// Set the batch sequence
    pub fn with_sequence(mut self, sequence: Option<u64>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set payload headers
    pub fn with_headers(mut self, headers: &'a Metadata) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Expand every placeholder in `template`
pub fn render(template: &str, ctx: &NamingContext<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = match after.find('}') {
            Some(end) => end,
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        };
        let name = &after[..end];
        match resolve(name, ctx) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn resolve(name: &str, ctx: &NamingContext<'_>) -> Option<String> {
    match name {
        "timestamp" => Some(ctx.now.timestamp_millis().to_string()),
        "datetime" => Some(ctx.now.format("%Y%m%d_%H%M%S").to_string()),
        "date" => Some(ctx.now.format("%Y%m%d").to_string()),
        "time" => Some(ctx.now.format("%H%M%S").to_string()),
        "batch" => ctx.sequence.map(|s| s.to_string()),
        "uuid" => Some(uuid::Uuid::new_v4().to_string()),
        header => ctx
            .headers
            .and_then(|headers| headers.get(header))
            .map(header_text),
    }
}

/// Header values never introduce path separators
fn header_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace(['/', '\\'], "_")
}

/// Default name of a batch unit: `batch_<yyyyMMdd_HHmmss>_<seq><extension>`
pub fn default_batch_name(ctx: &NamingContext<'_>, extension: &str) -> String {
    format!(
        "batch_{}_{}{}",
        ctx.now.format("%Y%m%d_%H%M%S"),
        ctx.sequence.unwrap_or(0),
        extension
    )
}

/// Default name of a single artifact: `file_<epoch ms><extension>`
pub fn default_file_name(ctx: &NamingContext<'_>, extension: &str) -> String {
    format!("file_{}{}", ctx.now.timestamp_millis(), extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx_at() -> NamingContext<'static> {
        NamingContext {
            now: Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
            sequence: Some(12),
            headers: None,
        }
    }

    #[test]
    fn test_time_placeholders() {
        let ctx = ctx_at();
        assert_eq!(
            render("out_${date}_${time}.csv", &ctx),
            "out_20240305_140709.csv"
        );
        assert_eq!(render("${datetime}", &ctx), "20240305_140709");
        assert_eq!(
            render("${timestamp}", &ctx),
            ctx.now.timestamp_millis().to_string()
        );
    }

    #[test]
    fn test_batch_and_headers() {
        let mut headers = Metadata::new();
        headers.insert("orderId".into(), Value::from("A/17"));
        headers.insert("count".into(), Value::from(3));
        let ctx = ctx_at().with_headers(&headers);

        assert_eq!(
            render("${orderId}-${count}-${batch}.xml", &ctx),
            "A_17-3-12.xml"
        );
    }

    #[test]
    fn test_unknown_and_unterminated_placeholders_are_kept() {
        let ctx = ctx_at();
        assert_eq!(render("a_${missing}_b", &ctx), "a_${missing}_b");
        assert_eq!(render("a_${date", &ctx), "a_${date");
    }

    #[test]
    fn test_uuid_is_unique() {
        let ctx = ctx_at();
        assert_ne!(render("${uuid}", &ctx), render("${uuid}", &ctx));
    }

    #[test]
    fn test_default_names() {
        let ctx = ctx_at();
        assert_eq!(default_batch_name(&ctx, ".txt"), "batch_20240305_140709_12.txt");
        assert!(default_file_name(&ctx, ".txt").starts_with("file_"));
    }
}
