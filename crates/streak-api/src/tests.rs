use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use streak_db::Database;
use streak_gateway::{ConnectionNotice, Dispatcher};
use streak_types::models::ConversationKey;

use crate::auth::{AppState, AppStateInner};
use crate::router;

struct TestApp {
    app: axum::Router,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let state: AppState = Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: "test-secret".into(),
            dispatcher: Dispatcher::new(),
        });
        Self {
            app: router(state.clone()),
            state,
        }
    }

    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Register a user and return (user_id, token).
    async fn register(&self, username: &str) -> (Uuid, String) {
        let (status, body) = self
            .call(
                Method::POST,
                "/auth/register",
                None,
                Some(json!({ "username": username, "password": "hunter22!" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        (
            body["user_id"].as_str().unwrap().parse().unwrap(),
            body["token"].as_str().unwrap().to_string(),
        )
    }
}

fn micros(ts: &str) -> String {
    ts.parse::<DateTime<Utc>>()
        .unwrap()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[tokio::test]
async fn register_and_login() {
    let app = TestApp::new();
    let (user_id, _) = app.register("ana").await;

    let (status, _) = app
        .call(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "username": "ana", "password": "another-pass" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .call(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "username": "ana", "password": "hunter22!" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], json!(user_id));
    assert_eq!(body["username"], "ana");
    let token = body["token"].as_str().unwrap();
    let (status, _) = app.call(Method::GET, "/conversations", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);

    for (username, password) in [("ana", "wrong-pass"), ("nobody", "hunter22!")] {
        let (status, _) = app
            .call(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    for (username, password) in [("al", "hunter22!"), ("ben", "short")] {
        let (status, _) = app
            .call(
                Method::POST,
                "/auth/register",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let app = TestApp::new();
    let (status, _) = app.call(Method::GET, "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call(Method::GET, "/conversations", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn direct_message_publish_list_and_read() {
    let app = TestApp::new();
    let (ana, ana_token) = app.register("ana").await;
    let (ben, ben_token) = app.register("ben").await;
    let mut changes = app.state.dispatcher.subscribe();

    let (status, sent) = app
        .call(
            Method::POST,
            "/messages",
            Some(&ana_token),
            Some(json!({ "recipient": { "kind": "user", "id": ben }, "content": "  day 3 done  " })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["content"], "day 3 done");

    let change = changes.recv().await.unwrap();
    assert_eq!(change.message.id.to_string(), sent["id"].as_str().unwrap());
    assert_eq!(change.message.sender_id, ana);

    let dm = ConversationKey::Direct(ana).to_string();
    let (status, memberships) = app.call(Method::GET, "/conversations", Some(&ben_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(memberships[0]["conversation"], dm);
    assert_eq!(memberships[0]["last_read_at"], Value::Null);

    let (status, messages) = app
        .call(Method::GET, &format!("/conversations/{}/messages", dm), Some(&ben_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);
    assert_eq!(
        micros(messages[0]["created_at"].as_str().unwrap()),
        micros(sent["created_at"].as_str().unwrap())
    );

    let read_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let (status, _) = app
        .call(
            Method::PUT,
            &format!("/conversations/{}/read", dm),
            Some(&ben_token),
            Some(json!({ "read_at": read_at })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, memberships) = app.call(Method::GET, "/conversations", Some(&ben_token), None).await;
    assert_eq!(micros(memberships[0]["last_read_at"].as_str().unwrap()), read_at);

    let (_, after) = app
        .call(
            Method::GET,
            &format!("/conversations/{}/messages?after={}", dm, read_at),
            Some(&ben_token),
            None,
        )
        .await;
    assert!(after.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_messages_are_rejected() {
    let app = TestApp::new();
    let (ana, token) = app.register("ana").await;

    let cases = [
        json!({ "recipient": { "kind": "user", "id": Uuid::new_v4() }, "content": "hello?" }),
        json!({ "recipient": { "kind": "user", "id": ana }, "content": "note to self" }),
        json!({ "recipient": { "kind": "user", "id": Uuid::new_v4() }, "content": "   " }),
    ];
    let expected = [StatusCode::NOT_FOUND, StatusCode::BAD_REQUEST, StatusCode::BAD_REQUEST];

    for (body, want) in cases.into_iter().zip(expected) {
        let (status, _) = app.call(Method::POST, "/messages", Some(&token), Some(body)).await;
        assert_eq!(status, want);
    }
}

#[tokio::test]
async fn groups_enforce_membership_and_notify_members() {
    let app = TestApp::new();
    let (ana, ana_token) = app.register("ana").await;
    let (ben, ben_token) = app.register("ben").await;
    let (_carl, carl_token) = app.register("carl").await;
    let (_conn, mut ben_notices) = app.state.dispatcher.register_connection(ben).await;

    let (status, group) = app
        .call(
            Method::POST,
            "/groups",
            Some(&ana_token),
            Some(json!({ "name": "30 day plank", "member_ids": [ben] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let group_id: Uuid = group["id"].as_str().unwrap().parse().unwrap();
    let mut members: Vec<Uuid> = serde_json::from_value(group["member_ids"].clone()).unwrap();
    members.sort();
    let mut expected = vec![ana, ben];
    expected.sort();
    assert_eq!(members, expected);
    assert_eq!(ben_notices.recv().await, Some(ConnectionNotice::JoinedGroup(group_id)));

    let to_group = json!({ "recipient": { "kind": "conversation", "id": group_id }, "content": "plank time" });
    let (status, _) = app.call(Method::POST, "/messages", Some(&ben_token), Some(to_group.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app.call(Method::POST, "/messages", Some(&carl_token), Some(to_group)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let path = format!("/conversations/{}/messages", ConversationKey::Group(group_id));
    let (status, messages) = app.call(Method::GET, &path, Some(&ana_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);
    let (status, _) = app.call(Method::GET, &path, Some(&carl_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(
            Method::POST,
            "/groups",
            Some(&ana_token),
            Some(json!({ "name": "ghosts", "member_ids": [Uuid::new_v4()] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
