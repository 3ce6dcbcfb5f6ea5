use serde_json::Value;
use tracing::debug;

use super::PageParser;
use crate::types::{Payload, ProductRecord};

/// Reads product listings served as JSON: either an array of products or an
/// object holding one under `products` / `items`.
#[derive(Debug, Default, Clone)]
pub struct JsonProductParser;

impl PageParser for JsonProductParser {
    fn parse(&self, payload: &Payload) -> Vec<ProductRecord> {
        let Some(json) = payload.as_json() else {
            debug!("Non-JSON listing payload, nothing to parse");
            return Vec::new();
        };
        let entries = match json {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("products").or_else(|| map.get("items")) {
                Some(Value::Array(items)) => items.as_slice(),
                _ => std::slice::from_ref(json),
            },
            _ => return Vec::new(),
        };
        entries.iter().filter_map(parse_product).collect()
    }
}

fn parse_product(v: &Value) -> Option<ProductRecord> {
    let sku = v.get("sku")?.as_str()?.trim();
    if sku.is_empty() {
        return None;
    }
    let price = match v.get("price")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_price(s)?,
        _ => return None,
    };
    Some(ProductRecord {
        sku: sku.to_string(),
        brand: str_field(v, "brand"),
        model: str_field(v, "model"),
        price,
        url: str_field(v, "url"),
    })
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Accepts "129,99 €", "$129.99", "1.299,00".
fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };
    normalized.parse::<f64>().ok().filter(|p| *p >= 0.0)
}
