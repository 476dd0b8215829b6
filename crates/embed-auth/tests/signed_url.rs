use embed_auth::{create_signed_url, EmbedUser};
use serde_json::{json, Map, Value};

fn attributes() -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("locale".into(), json!("en_US"));
    attributes
}

#[test]
fn fresh_urls_differ_by_nonce() {
    let user = EmbedUser::new("user-1", 3_600).with_models(["thelook"]);
    let first = create_signed_url(
        "/embed/looks/1",
        &user,
        "example.looker.com",
        "k",
        None,
        Some(10),
    )
    .expect("first");
    let second = create_signed_url(
        "/embed/looks/1",
        &user,
        "example.looker.com",
        "k",
        None,
        Some(10),
    )
    .expect("second");
    assert_ne!(first, second);
}

#[test]
fn user_attributes_and_timezone_are_json_encoded() {
    let mut user = EmbedUser::new("user-1", 3_600);
    user.user_attributes = Some(attributes());
    user.user_timezone = Some("Europe/Paris".into());
    let url = create_signed_url(
        "/embed/looks/1",
        &user,
        "example.looker.com",
        "k",
        Some("n"),
        Some(1),
    )
    .expect("signed");
    assert!(url.contains("&user_attributes=%7B%22locale%22%3A%22en_US%22%7D&"));
    assert!(url.contains("&user_timezone=%22Europe%2FParis%22&signature="));
}
