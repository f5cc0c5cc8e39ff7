// Optimistic send tests
// Sending, acknowledgment matching, failures and retries against a
// recording channel.

use anyhow::Result;

use parley::conversation::{InboundFrame, LifecycleEvent, OutboundPayload};
use parley::models::{MessageStatus, Sender};

mod common;
use common::{ack, success, Harness, ScriptedHistory, CONVERSATION, LOCAL, REMOTE};

#[tokio::test]
async fn test_send_hello_goes_pending_then_sent() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());

    let id = h.conversation.send("Hello").expect("send should be accepted");
    let messages = h.conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].text, "Hello");
    assert_eq!(messages[0].sender, Sender::LocalUser);
    assert_eq!(messages[0].status, MessageStatus::Pending);

    h.pump_until(|h| h.channel.sent().len() == 1).await?;
    match &h.channel.sent()[0] {
        OutboundPayload::SendMessage {
            sender_id,
            receiver_id,
            conversation_id,
            message,
            client_message_id,
        } => {
            assert_eq!(sender_id, LOCAL);
            assert_eq!(receiver_id, REMOTE);
            assert_eq!(conversation_id, CONVERSATION);
            assert_eq!(message, "Hello");
            assert_eq!(client_message_id, &id);
        }
    }

    h.frame(ack("Hello", Some(&id), None));
    let messages = h.conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn test_send_is_refused_unless_connected() -> Result<()> {
    let mut h = Harness::new(ScriptedHistory::default());
    assert!(!h.conversation.can_send());
    assert_eq!(h.conversation.send("too early"), None);

    h.lifecycle(LifecycleEvent::Open);
    h.lifecycle(LifecycleEvent::Close);
    assert!(!h.conversation.can_send());
    assert_eq!(h.conversation.send("too late"), None);

    h.pump().await;
    assert!(h.conversation.messages().is_empty());
    assert!(h.channel.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_blank_text_is_not_sent() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    assert_eq!(h.conversation.send("   \n"), None);
    assert!(h.conversation.messages().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_error_frame_fails_message_and_retry_resends_it() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    let id = h.conversation.send("Is the umbrella still there?").expect("send accepted");
    h.pump_until(|h| h.channel.sent().len() == 1).await?;

    h.frame(InboundFrame::Error {
        error: Some("rate limited".to_string()),
    });
    let failed = h.conversation.messages()[0].clone();
    assert_eq!(failed.status, MessageStatus::Failed);
    let handle = failed.retry.expect("failed message carries a retry handle");
    assert_eq!(handle.message_id(), id);

    // The handle only queues the retry; the conversation applies it.
    assert!(handle.retry());
    h.pump_until(|h| h.channel.sent().len() == 2).await?;
    let retried = &h.conversation.messages()[0];
    assert_eq!(retried.id, id);
    assert_eq!(retried.status, MessageStatus::Pending);
    assert!(retried.retry.is_none());

    h.frame(ack("Is the umbrella still there?", Some(&id), None));
    assert_eq!(h.conversation.messages()[0].status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn test_transport_failure_marks_message_failed() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    h.channel.fail_transmits(true);

    h.conversation.send("Found your keys").expect("send accepted");
    h.pump_until(|h| h.conversation.messages()[0].status == MessageStatus::Failed)
        .await?;
    assert!(h.conversation.messages()[0].retry.is_some());

    // Retrying a sent or pending message does nothing.
    h.channel.fail_transmits(false);
    let id = h.conversation.messages()[0].id.clone();
    assert!(h.conversation.retry(&id));
    assert!(!h.conversation.retry(&id));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_fails_every_outstanding_send() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    h.conversation.send("first").expect("send accepted");
    h.conversation.send("second").expect("send accepted");
    h.pump_until(|h| h.channel.sent().len() == 2).await?;

    h.lifecycle(LifecycleEvent::Close);
    let statuses: Vec<MessageStatus> = h.conversation.messages().iter().map(|m| m.status).collect();
    assert_eq!(statuses, vec![MessageStatus::Failed, MessageStatus::Failed]);

    // Retrying has to wait for the connection to come back.
    let id = h.conversation.messages()[0].id.clone();
    assert!(!h.conversation.retry(&id));
    Ok(())
}

#[tokio::test]
async fn test_acks_without_client_id_match_in_send_order() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    let first = h.conversation.send("one").expect("send accepted");
    let second = h.conversation.send("two").expect("send accepted");

    h.frame(ack("one", None, None));
    let status_of = |h: &Harness, id: &str| {
        h.conversation
            .messages()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.status)
    };
    assert_eq!(status_of(&h, &first), Some(MessageStatus::Sent));
    assert_eq!(status_of(&h, &second), Some(MessageStatus::Pending));

    // An ack naming an unknown client id touches nothing.
    h.frame(ack("two", Some("not-ours"), None));
    assert_eq!(status_of(&h, &second), Some(MessageStatus::Pending));

    h.frame(ack("two", Some(&second), None));
    assert_eq!(status_of(&h, &second), Some(MessageStatus::Sent));
    Ok(())
}

#[tokio::test]
async fn test_server_id_replaces_local_id() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    let local_id = h.conversation.send("See you at the library").expect("send accepted");

    h.frame(ack("See you at the library", Some(&local_id), Some("srv-77")));
    assert_eq!(h.ids(), vec!["srv-77".to_string()]);
    assert_eq!(h.conversation.messages()[0].status, MessageStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn test_remote_messages_are_received() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    h.frame(success(REMOTE, "I have your wallet"));
    h.frame(success("mallory", "not part of this chat"));
    h.frame(success(REMOTE, "  "));

    let messages = h.conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, Sender::RemoteUser);
    assert_eq!(messages[0].status, MessageStatus::Received);
    assert_eq!(messages[0].text, "I have your wallet");
    Ok(())
}

#[tokio::test]
async fn test_stray_error_frame_is_ignored() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    let before = h.conversation.revision();
    h.frame(InboundFrame::Error { error: None });
    assert_eq!(h.conversation.revision(), before);
    Ok(())
}

#[tokio::test]
async fn test_late_echo_confirms_message_failed_by_disconnect() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    let id = h.conversation.send("Blue backpack, third floor").expect("send accepted");
    h.pump_until(|h| h.channel.sent().len() == 1).await?;

    h.lifecycle(LifecycleEvent::Close);
    assert_eq!(h.conversation.messages()[0].status, MessageStatus::Failed);

    // The server had it after all.
    h.frame(ack("Blue backpack, third floor", Some(&id), Some("srv-12")));
    let messages = h.conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "srv-12");
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert!(messages[0].retry.is_none());

    h.lifecycle(LifecycleEvent::ReconnectAttempt);
    h.lifecycle(LifecycleEvent::Open);
    assert!(!h.conversation.retry("srv-12"));
    assert!(!h.conversation.retry(&id));
    Ok(())
}

#[tokio::test]
async fn test_echo_without_client_id_does_not_revive_failed_message() -> Result<()> {
    let mut h = Harness::connected(ScriptedHistory::default());
    h.conversation.send("lost keys").expect("send accepted");
    h.lifecycle(LifecycleEvent::Close);

    h.frame(ack("lost keys", None, None));
    assert_eq!(h.conversation.messages()[0].status, MessageStatus::Failed);
    Ok(())
}
