mod common;

use std::time::Duration;

use common::{detection, TestApp};
use firewatch::vision::DetectionClass;
use firewatch::webhooks::alerts::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use firewatch::webhooks::SignatureGenerator;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SECRET: &str = "whsec_test";

async fn wait_for_requests(server: &MockServer, expected: usize) -> Vec<Request> {
    for _ in 0..100 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= expected {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

#[tokio::test]
async fn fire_raises_then_clears_a_signed_alert() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/alerts", server.uri());
    let app = TestApp::with_config(|cfg| {
        cfg.alert_webhook_url = Some(url);
        cfg.alert_webhook_secret = Some(SECRET.to_string());
        cfg.alert_cooldown_secs = 0;
    })
    .await;

    let session_id = app.monitor().start().await.unwrap();
    app.analyse(vec![detection(DetectionClass::Fire, 0.9)]).await;
    app.analyse(Vec::new()).await;

    let received = wait_for_requests(&server, 2).await;
    assert_eq!(received.len(), 2);

    let raised: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(raised["type"], "alert.raised");
    assert_eq!(raised["session_id"], session_id);
    assert_eq!(raised["fire"], 1);

    let cleared: serde_json::Value = serde_json::from_slice(&received[1].body).unwrap();
    assert_eq!(cleared["type"], "alert.cleared");

    let request = &received[0];
    let timestamp = request.headers[TIMESTAMP_HEADER].to_str().unwrap();
    let signature = request.headers[SIGNATURE_HEADER].to_str().unwrap();
    let expected = SignatureGenerator::new(SECRET.to_string())
        .sign_payload(timestamp, std::str::from_utf8(&request.body).unwrap())
        .unwrap();
    assert_eq!(signature, expected);
}

#[tokio::test]
async fn stopping_clears_an_open_alert() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let url = server.uri();
    let app = TestApp::with_config(|cfg| {
        cfg.alert_webhook_url = Some(url);
        cfg.alert_cooldown_secs = 0;
    })
    .await;

    app.monitor().start().await.unwrap();
    app.analyse(vec![detection(DetectionClass::Smoke, 0.5)]).await;
    app.monitor().stop().await.unwrap();

    let received = wait_for_requests(&server, 2).await;
    assert_eq!(received.len(), 2);
    let cleared: serde_json::Value = serde_json::from_slice(&received[1].body).unwrap();
    assert_eq!(cleared["type"], "alert.cleared");
    assert!(!received[0].headers.contains_key(SIGNATURE_HEADER));
}
