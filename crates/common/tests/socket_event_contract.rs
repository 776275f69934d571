use uuid::Uuid;
use wsbroker_common::protocol::{decode_event, encode_event, SystemEvent};

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/socket-events.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn contract_system_events() -> Vec<(String, i64, Option<String>)> {
    load_contract()["system_events"]
        .as_array()
        .expect("system_events should be an array")
        .iter()
        .map(|entry| {
            (
                entry["name"].as_str().expect("name should be a string").to_string(),
                entry["key"].as_i64().expect("key should be an integer"),
                entry["message"].as_str().map(str::to_string),
            )
        })
        .collect()
}

#[test]
fn system_event_keys_match_contract() {
    let expected = contract_system_events();
    assert_eq!(expected.len(), SystemEvent::ALL.len());

    for (name, key, _) in expected {
        let event = SystemEvent::from_name(&name).expect("contract event should be known");
        assert_eq!(event.key(), key, "key mismatch for {name}");
    }
}

#[test]
fn encoded_envelope_uses_contract_field_names() {
    let contract = load_contract();
    let expected: Vec<&str> = contract["envelope_fields"]
        .as_array()
        .expect("envelope_fields should be an array")
        .iter()
        .map(|field| field.as_str().expect("field should be a string"))
        .collect();

    let encoded = encode_event(&SystemEvent::Pong.event(serde_json::Value::Null))
        .expect("envelope should encode");
    let value: serde_json::Value = serde_json::from_str(&encoded).expect("encoded frame is JSON");
    let mut actual: Vec<&str> =
        value.as_object().expect("envelope is an object").keys().map(String::as_str).collect();
    actual.sort_unstable();

    let mut expected_sorted = expected.clone();
    expected_sorted.sort_unstable();
    assert_eq!(actual, expected_sorted);
}

#[test]
fn legacy_aliases_decode_to_contract_fields() {
    let contract = load_contract();
    let aliases = contract["legacy_field_aliases"].as_object().expect("aliases should be an object");

    let mut legacy = serde_json::Map::new();
    for (alias, field) in aliases {
        let value = match field.as_str() {
            Some("event_key") => serde_json::json!(42),
            Some("event_name") => serde_json::json!("LEGACY"),
            _ => serde_json::json!({ "ok": true }),
        };
        legacy.insert(alias.clone(), value);
    }

    let event = decode_event(&serde_json::Value::Object(legacy).to_string())
        .expect("legacy envelope should decode");
    assert_eq!(event.event_key, 42);
    assert_eq!(event.event_name, "LEGACY");
    assert_eq!(event.data["ok"], true);
}

#[test]
fn connection_announcements_carry_contract_messages() {
    let connection_id = Uuid::new_v4();

    for (name, _, message) in contract_system_events() {
        let event = match SystemEvent::from_name(&name) {
            Some(SystemEvent::Connected) => SystemEvent::connected(connection_id),
            Some(SystemEvent::Disconnected) => SystemEvent::disconnected(connection_id),
            _ => continue,
        };
        assert_eq!(event.data["message"].as_str(), message.as_deref());
        assert_eq!(event.data["connection_id"], connection_id.to_string());
    }
}
