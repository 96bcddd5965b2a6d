use serde_json::Value;

use crate::events::{AgentEvent, ProductItem};

/// Parse the `data` object of a `response` message.
///
/// A product payload becomes a products event only when at least one item
/// survives validation; otherwise it yields nothing, even if it also carries
/// `text`. Other payloads with a non-empty `text` become a text event.
pub fn parse_response(data: &Value) -> Option<AgentEvent> {
    let data = data.as_object()?;

    if data.get("entity_type").and_then(Value::as_str) == Some("product") {
        let items: Vec<ProductItem> = data
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_product).collect())
            .unwrap_or_default();

        if items.is_empty() {
            log::debug!("Dropping product response without valid items");
            return None;
        }
        return Some(AgentEvent::Products {
            items,
            title: non_empty_str(data.get("title")),
            follow_up: non_empty_str(data.get("follow_up_question")),
        });
    }

    let text = non_empty_str(data.get("text"))?;
    Some(AgentEvent::Text { text })
}

/// Validate one product item. Missing id or title drops the item; bad price or
/// image fields are just omitted.
pub fn parse_product(item: &Value) -> Option<ProductItem> {
    let id = match item.get("id")? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let title = non_empty_str(item.get("title"))?;

    let price = match item.get("price") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|p| p.is_finite()),
        _ => None,
    };
    let image_url = non_empty_str(item.get("image_url"));

    Some(ProductItem {
        id,
        title,
        price,
        image_url,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_id_coerced() {
        let item = parse_product(&json!({"id": 1, "title": "X"})).unwrap();
        assert_eq!(item.id, "1");
        assert_eq!(item.title, "X");
        assert_eq!(item.price, None);
        assert_eq!(item.image_url, None);
    }

    #[test]
    fn test_item_requirements() {
        assert!(parse_product(&json!({"title": "X"})).is_none());
        assert!(parse_product(&json!({"id": null, "title": "X"})).is_none());
        assert!(parse_product(&json!({"id": "a"})).is_none());
        assert!(parse_product(&json!({"id": "a", "title": ""})).is_none());
        assert!(parse_product(&json!({"id": "a", "title": 5})).is_none());
    }

    #[test]
    fn test_price_forms() {
        let numeric = parse_product(&json!({"id": "a", "title": "T", "price": 12.5})).unwrap();
        assert_eq!(numeric.price, Some(12.5));

        let string = parse_product(&json!({"id": "a", "title": "T", "price": "9.99"})).unwrap();
        assert_eq!(string.price, Some(9.99));

        let junk = parse_product(&json!({"id": "a", "title": "T", "price": "cheap"})).unwrap();
        assert_eq!(junk.price, None);

        let wrong = parse_product(&json!({"id": "a", "title": "T", "price": [1]})).unwrap();
        assert_eq!(wrong.price, None);
    }

    #[test]
    fn test_image_url() {
        let ok = parse_product(&json!({"id": "a", "title": "T", "image_url": "https://x/y.png"}))
            .unwrap();
        assert_eq!(ok.image_url.as_deref(), Some("https://x/y.png"));

        let empty = parse_product(&json!({"id": "a", "title": "T", "image_url": ""})).unwrap();
        assert_eq!(empty.image_url, None);
    }

    #[test]
    fn test_invalid_items_dropped_individually() {
        let event = parse_response(&json!({
            "entity_type": "product",
            "title": "Tents",
            "follow_up_question": "Which size?",
            "items": [
                {"id": 1, "title": "Dome"},
                {"id": 2},
                {"id": "3", "title": "Tunnel", "price": "199"}
            ]
        }))
        .unwrap();

        match event {
            AgentEvent::Products {
                items,
                title,
                follow_up,
            } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].id, "1");
                assert_eq!(items[1].id, "3");
                assert_eq!(items[1].price, Some(199.0));
                assert_eq!(title.as_deref(), Some("Tents"));
                assert_eq!(follow_up.as_deref(), Some("Which size?"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_text_response() {
        assert_eq!(
            parse_response(&json!({"text": "Hello"})),
            Some(AgentEvent::Text {
                text: "Hello".into()
            })
        );
    }

    #[test]
    fn test_no_event_for_empty_or_unknown() {
        assert_eq!(parse_response(&json!({})), None);
        assert_eq!(parse_response(&json!({"text": ""})), None);
        assert_eq!(parse_response(&json!("plain string")), None);
        assert_eq!(
            parse_response(&json!({"entity_type": "product", "items": []})),
            None
        );
        assert_eq!(
            parse_response(&json!({"entity_type": "product", "items": [{"id": 1}]})),
            None
        );
    }

    #[test]
    fn test_product_without_valid_items_ignores_text() {
        let event = parse_response(&json!({
            "entity_type": "product",
            "items": [{"title": "no id"}],
            "text": "Sorry, nothing matched"
        }));
        assert_eq!(event, None);
    }
}
