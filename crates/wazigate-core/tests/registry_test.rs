#![allow(clippy::unwrap_used)]
// Clouds registry persistence and configuration rules.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wazigate_core::bridge::Downstream;
use wazigate_core::clouds::registry::{DEFAULT_CLOUD_ID, DEFAULT_CLOUD_REST};
use wazigate_core::clouds::{Action, CloudConfig, CloudContext, Clouds, Entity};
use wazigate_core::model::{Device, Sensor};
use wazigate_core::store::{MemoryStore, Store};
use wazigate_mqtt::Message;

struct Discard;

impl Downstream for Discard {
    fn publish(&self, _msg: &Message) -> usize {
        0
    }
}

fn context(dir: &Path, store: Arc<MemoryStore>) -> Arc<CloudContext> {
    Arc::new(CloudContext::new(
        "gw",
        store as Arc<dyn Store>,
        Arc::new(Discard) as Arc<dyn Downstream>,
        dir.join("session"),
    ))
}

async fn load(dir: &Path) -> Clouds {
    let ctx = context(dir, Arc::new(MemoryStore::new()));
    Clouds::load(ctx, dir.join("clouds.json")).await.unwrap()
}

fn read_file(dir: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(dir.join("clouds.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// ── Loading ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_start_registers_paused_default_cloud() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = load(dir.path()).await;

    assert_eq!(clouds.len(), 1);
    let cloud = clouds.get(DEFAULT_CLOUD_ID).unwrap();
    assert!(cloud.is_paused());
    assert_eq!(
        cloud.config().rest,
        wazigate_api::rest_addr(DEFAULT_CLOUD_REST).unwrap()
    );

    let file = read_file(dir.path());
    assert_eq!(file["waziup"]["paused"], json!(true));
    assert_eq!(file["waziup"]["rest"], json!("https://api.waziup.io/api/v2"));
}

#[tokio::test]
async fn test_existing_file_is_loaded_and_ids_filled_in() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("clouds.json"),
        r#"{
            "a": { "id": "", "paused": true, "rest": "https://a.test/api" },
            "b": { "id": "b", "paused": true, "rest": "https://b.test/api",
                   "credentials": { "username": "bob", "token": "pw" } }
        }"#,
    )
    .unwrap();

    let clouds = load(dir.path()).await;
    let ids: Vec<String> = clouds.list().iter().map(wazigate_core::Cloud::id).collect();
    assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(clouds.get("b").unwrap().credentials().username, "bob");
}

#[tokio::test]
async fn test_malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("clouds.json"), "{ not json").unwrap();
    let ctx = context(dir.path(), Arc::new(MemoryStore::new()));
    let err = Clouds::load(ctx, dir.path().join("clouds.json"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), 500);
}

// ── Mutations ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_add_normalizes_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = load(dir.path()).await;

    let cloud = clouds
        .add(CloudConfig::new("lab", "lab.example.org/api/v2/?debug=1"))
        .await
        .unwrap();
    assert_eq!(cloud.config().rest, "https://lab.example.org/api/v2");
    assert!(!cloud.is_pausing());

    let file = read_file(dir.path());
    assert_eq!(file["lab"]["rest"], json!("https://lab.example.org/api/v2"));

    // A second registry sees the same clouds.
    let reloaded = load(dir.path()).await;
    assert_eq!(reloaded.len(), 2);
}

#[tokio::test]
async fn test_add_rejects_duplicates_and_empty_ids() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = load(dir.path()).await;

    let err = clouds
        .add(CloudConfig::new(DEFAULT_CLOUD_ID, "https://other.test"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), 409);

    let err = clouds
        .add(CloudConfig::new("  ", "https://other.test"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), 400);
    assert_eq!(clouds.len(), 1);
}

#[tokio::test]
async fn test_remove_forgets_the_cloud() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = load(dir.path()).await;

    clouds.remove(DEFAULT_CLOUD_ID).await.unwrap();
    assert!(clouds.is_empty());
    assert_eq!(read_file(dir.path()), json!({}));
    assert_eq!(clouds.remove(DEFAULT_CLOUD_ID).await.unwrap_err().code(), 404);
}

#[tokio::test]
async fn test_credentials_are_checked_then_saved() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/token"))
        .and(body_json(json!({ "username": "alice", "password": "s3cret" })))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/token"))
        .and(body_json(json!({ "username": "alice", "password": "wrong" })))
        .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
        .mount(&server)
        .await;

    let clouds = load(dir.path()).await;
    clouds
        .add(CloudConfig::new("mock", format!("{}/api/v2", server.uri())))
        .await
        .unwrap();

    let code = clouds
        .set_credentials("mock", "alice", SecretString::from("s3cret"))
        .await
        .unwrap();
    assert_eq!(code, 200);
    assert_eq!(
        read_file(dir.path())["mock"]["credentials"],
        json!({ "username": "alice", "token": "s3cret" })
    );

    let err = clouds
        .set_credentials("mock", "alice", SecretString::from("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_auth_error());
    assert_eq!(clouds.get("mock").unwrap().config().status_code, 401);
    assert_eq!(
        read_file(dir.path())["mock"]["credentials"]["token"],
        json!("s3cret")
    );
}

#[tokio::test]
async fn test_addresses_are_saved() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = load(dir.path()).await;

    clouds
        .set_rest_addr(DEFAULT_CLOUD_ID, "http://10.0.0.5:8080/api/v2")
        .await
        .unwrap();
    clouds
        .set_mqtt_addr(DEFAULT_CLOUD_ID, "10.0.0.6")
        .await
        .unwrap();

    let cloud = clouds.get(DEFAULT_CLOUD_ID).unwrap();
    assert_eq!(cloud.mqtt_addr().unwrap(), "10.0.0.6:1883");
    let file = read_file(dir.path());
    assert_eq!(file["waziup"]["rest"], json!("http://10.0.0.5:8080/api/v2"));
    assert_eq!(file["waziup"]["mqtt"], json!("10.0.0.6"));
}

// ── Flag fan-out ────────────────────────────────────────────────────

#[tokio::test]
async fn test_flags_reach_every_cloud_and_respect_do_not_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut quiet = Device::new("quiet", "Quiet").with_sensor(Sensor::new("s1", "Temp"));
    quiet.meta.insert("doNotSync", json!(true));
    store.put_device(quiet).await.unwrap();
    store
        .put_device(Device::new("d1", "Device").with_sensor(Sensor::new("s1", "Temp")))
        .await
        .unwrap();

    let ctx = context(dir.path(), store);
    let clouds = Clouds::load(ctx, dir.path().join("clouds.json")).await.unwrap();
    clouds
        .add(CloudConfig::new("second", "https://second.test"))
        .await
        .unwrap();

    clouds.flag_sensor("d1", "s1", Action::SYNC).await;
    clouds.flag_sensor("quiet", "s1", Action::SYNC).await;
    clouds.flag_device("quiet", Action::CREATE).await;
    clouds.flag_sensor("missing", "s1", Action::SYNC).await;

    for cloud in clouds.list() {
        assert_eq!(cloud.dirty().len(), 1, "cloud {}", cloud.id());
        let status = cloud.dirty().get(&Entity::sensor("d1", "s1")).unwrap();
        assert_eq!(status.action, Action::SYNC);
    }
}
