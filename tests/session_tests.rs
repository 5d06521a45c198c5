//! Tests for the session context driving real HTTP streams from a stub
//! server: submit, cancel, failure, regeneration and list maintenance.

use std::time::Duration;

use aiaio_client::model::Role;
use aiaio_client::reconciler::CancelHandle;
use aiaio_client::{ClientConfig, ClientError, SessionContext, StreamOutcome};
use serde_json::json;
use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn session(server: &MockServer) -> SessionContext {
    SessionContext::new(ClientConfig::new(server.uri()))
}

async fn mount_create(server: &MockServer, id: &str) {
    Mock::given(method("POST"))
        .and(path("/create_conversation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"conversation_id": id})))
        .mount(server)
        .await;
}

async fn mount_chat(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn mount_history(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/conversations/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                {"message_id": "s0", "role": "system", "content": "sys"},
                {"message_id": "u1", "role": "user", "content": "hi"},
                {"message_id": "a1", "role": "assistant", "content": "hello"}
            ]
        })))
        .mount(server)
        .await;
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("finished within timeout")
}

async fn chat_body(server: &MockServer) -> String {
    let requests = server.received_requests().await.unwrap_or_default();
    requests
        .iter()
        .find(|r| r.url.path() == "/chat")
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_submit_creates_conversation_and_streams_reply() {
    let server = MockServer::start().await;
    mount_create(&server, "c-new").await;
    Mock::given(method("GET"))
        .and(path("/get_system_prompt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system_prompt": "Be brief."})))
        .mount(&server)
        .await;
    mount_chat(&server, ResponseTemplate::new(200).set_body_string("Hi there!")).await;

    let s = session(&server).await;
    let changes = s.changes();
    let handle = assert_ok!(s.submit("hello", vec![], None).await);
    assert_eq!(handle.conversation_id(), "c-new");
    assert_eq!(within(handle.finished()).await, StreamOutcome::Completed);
    assert!(changes.has_changed().unwrap());

    let pane = s.pane();
    assert_eq!(pane.conversation_id(), Some("c-new"));
    let roles: Vec<_> = pane.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(pane.messages()[0].source, "hello");
    assert_eq!(pane.messages()[1].source, "Hi there!");
    assert!(!s.is_streaming("c-new"));
    assert!(chat_body(&server).await.contains("Be brief."));
    assert_eq!(s.conversations()[0].conversation_id, "c-new");
}

#[tokio::test]
async fn test_explicit_system_prompt_skips_server_lookup() {
    let server = MockServer::start().await;
    mount_create(&server, "c1").await;
    Mock::given(method("GET"))
        .and(path("/get_system_prompt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system_prompt": "server"})))
        .expect(0)
        .mount(&server)
        .await;
    mount_chat(&server, ResponseTemplate::new(200).set_body_string("ok")).await;

    let s = session(&server).await;
    let handle = assert_ok!(s.submit("q", vec![], Some("Talk like a pirate.".into())).await);
    within(handle.finished()).await;
    assert!(chat_body(&server).await.contains("Talk like a pirate."));
}

#[tokio::test]
async fn test_failed_generation_notifies_once() {
    let server = MockServer::start().await;
    mount_create(&server, "c1").await;
    mount_chat(
        &server,
        ResponseTemplate::new(500).set_body_json(json!({"detail": "No default provider"})),
    )
    .await;

    let s = session(&server).await;
    let handle = assert_ok!(s.submit("q", vec![], None).await);
    let outcome = within(handle.finished()).await;
    assert!(matches!(outcome, StreamOutcome::Failed { notification: Some(_) }));

    let notes = s.notifications();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].message.starts_with("Generation failed"));
    assert!(notes[0].message.contains("No default provider"));
    assert_eq!(s.pane().messages()[0].source, "q");
    assert!(!s.is_streaming("c1"));

    assert!(s.dismiss_notification(notes[0].id));
    assert!(s.notifications().is_empty());
}

#[tokio::test]
async fn test_second_submit_rejected_while_streaming() {
    let server = MockServer::start().await;
    mount_create(&server, "c1").await;
    mount_chat(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("slow")
            .set_delay(Duration::from_secs(30)),
    )
    .await;

    let s = session(&server).await;
    let first = assert_ok!(s.submit("one", vec![], None).await);
    let err = assert_err!(s.submit("two", vec![], None).await);
    assert!(matches!(err, ClientError::StreamActive { .. }));
    assert_eq!(s.pane().messages().len(), 2);

    s.cancel("c1");
    assert_eq!(within(first.finished()).await, StreamOutcome::Cancelled);
    assert!(s.submit("three", vec![], None).await.is_ok());
    s.cancel("c1");
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_before_first_chunk() {
    let server = MockServer::start().await;
    mount_create(&server, "c1").await;
    mount_chat(
        &server,
        ResponseTemplate::new(200)
            .set_body_string("too late")
            .set_delay(Duration::from_secs(30)),
    )
    .await;

    let s = session(&server).await;
    let handle = assert_ok!(s.submit("hello", vec![], None).await);
    let out = s.cancel("c1");
    assert!(out.local);
    assert!(!out.remote_signal_sent, "live channel never opened");

    assert_eq!(within(handle.finished()).await, StreamOutcome::Cancelled);
    let pane = s.pane();
    assert_eq!(pane.messages().len(), 1);
    assert_eq!(pane.messages()[0].role, Role::User);
    assert!(s.notifications().is_empty());
    assert!(!s.is_streaming("c1"));
}

#[tokio::test]
async fn test_cancel_without_stream_is_noop() {
    let server = MockServer::start().await;
    let s = session(&server).await;
    let out = s.cancel("nothing");
    assert!(!out.local);
    assert!(!out.remote_signal_sent);
}

#[test]
fn test_cancel_handle_wakes_pending_waiter() {
    let h = CancelHandle::new();
    let mut waiter = tokio_test::task::spawn(h.cancelled());
    assert_pending!(waiter.poll());
    h.cancel();
    assert!(waiter.is_woken());
    assert_ready!(waiter.poll());
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_open_conversation_titles_from_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversations": [{"conversation_id": "c1", "summary": "Greeting", "last_updated": 5.0}]
        })))
        .mount(&server)
        .await;
    mount_history(&server).await;

    let s = session(&server).await;
    assert_ok!(s.refresh_conversations().await);
    assert_ok!(s.open_conversation("c1").await);

    let pane = s.pane();
    assert_eq!(pane.title(), Some("Greeting"));
    assert_eq!(pane.messages().len(), 2, "system message hidden");
    assert_eq!(pane.messages()[1].message_id.as_deref(), Some("a1"));
}

#[tokio::test]
async fn test_regenerate_replaces_message_in_place() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    Mock::given(method("POST"))
        .and(path("/regenerate_response"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Hello again."))
        .mount(&server)
        .await;

    let s = session(&server).await;
    assert_ok!(s.open_conversation("c1").await);
    let handle = assert_ok!(s.regenerate("a1", None).await);
    assert_eq!(within(handle.finished()).await, StreamOutcome::Completed);

    let pane = s.pane();
    assert_eq!(pane.messages().len(), 2);
    assert_eq!(pane.find_by_id("a1").unwrap().source, "Hello again.");

    let requests = server.received_requests().await.unwrap_or_default();
    let body = requests
        .iter()
        .find(|r| r.url.path() == "/regenerate_response")
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default();
    assert!(body.contains("a1"));
    assert!(body.contains("hi"), "prompt of the preceding user message");
}

#[tokio::test]
async fn test_regenerate_unknown_message() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    let s = session(&server).await;
    assert_ok!(s.open_conversation("c1").await);
    let err = assert_err!(s.regenerate("nope", None).await);
    assert!(matches!(err, ClientError::UnknownMessage { .. }));
}

#[tokio::test]
async fn test_delete_clears_displayed_conversation() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/conversations/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .mount(&server)
        .await;

    let s = session(&server).await;
    assert_ok!(s.open_conversation("c1").await);
    assert_ok!(s.delete_conversation("c1").await);
    assert!(s.pane().conversation_id().is_none());
    assert!(s.conversations().iter().all(|c| c.conversation_id != "c1"));
}

#[tokio::test]
async fn test_edit_and_rename_update_local_state() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    Mock::given(method("PUT"))
        .and(path("/messages/u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/conversations/c1/title"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .mount(&server)
        .await;

    let s = session(&server).await;
    assert_ok!(s.open_conversation("c1").await);
    assert_ok!(s.edit_message("u1", "hi there").await);
    assert_ok!(s.rename_conversation("c1", "Small talk").await);

    let pane = s.pane();
    assert_eq!(pane.find_by_id("u1").unwrap().source, "hi there");
    assert_eq!(pane.title(), Some("Small talk"));
}
