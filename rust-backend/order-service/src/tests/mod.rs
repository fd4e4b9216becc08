mod support;

use serde_json::{json, Value};

use crate::models::CreateOrderRequest;

pub(crate) fn order_request(items: Value, payment_method: &str) -> CreateOrderRequest {
    serde_json::from_value(order_body(items, payment_method)).expect("valid request")
}

pub(crate) fn order_body(items: Value, payment_method: &str) -> Value {
    json!({
        "items": items,
        "address": {
            "firstName": "Ada",
            "lastName": "Rossi",
            "line1": "Via Roma 1",
            "city": "Torino",
            "cap": "10121"
        },
        "payment_method": payment_method,
        "distance_km": 0
    })
}
