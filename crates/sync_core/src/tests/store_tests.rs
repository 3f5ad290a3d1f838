use super::*;
use chrono::TimeZone;
use serde_json::json;
use shared::domain::{ConversationStatus, MessageKind};

const OWN_PHONE: &str = "+5214793176502";

fn conversation_id() -> ConversationId {
    "conv_+5214773790184_+5214793176502".parse().expect("id")
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("timestamp")
}

fn message(id: &str, direction: MessageDirection, seconds: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: conversation_id(),
        content: format!("body of {id}"),
        direction,
        kind: MessageKind::Text,
        status: match direction {
            MessageDirection::Inbound => MessageStatus::Received,
            MessageDirection::Outbound => MessageStatus::Sent,
        },
        sender: "+5214773790184".into(),
        recipient: Some(OWN_PHONE.into()),
        created_at: at(seconds),
        updated_at: None,
        metadata: Default::default(),
    }
}

fn store_with_vip() -> ConversationStore {
    let mut store = ConversationStore::new(Some(OWN_PHONE.into()));
    let mut patch = ConversationPatch::new(conversation_id());
    patch.customer_name = Some("Ana".into());
    patch.tags = Some(vec!["VIP".into()]);
    patch.assigned_to = Some("agent-7".into());
    assert_eq!(store.upsert(patch), UpsertOutcome::Created);
    store
}

#[test]
fn adding_same_message_twice_keeps_one_copy() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let first = message("m-1", MessageDirection::Inbound, 0);

    assert_eq!(store.add_message(&id, first.clone()), AddOutcome::Added);
    assert_eq!(store.add_message(&id, first), AddOutcome::Duplicate);
    assert_eq!(store.messages(&id).len(), 1);
}

#[test]
fn add_message_creates_placeholder_for_unknown_conversation() {
    let mut store = ConversationStore::new(Some(OWN_PHONE.into()));
    let id = conversation_id();
    store.add_message(&id, message("m-1", MessageDirection::Inbound, 0));

    let conversation = store.conversation(&id).expect("placeholder");
    assert_eq!(conversation.customer_phone, "+5214773790184");
    assert_eq!(conversation.customer_name, "+5214773790184");
    assert!(conversation.needs_contact_data);
}

#[test]
fn messages_are_ordered_by_time_regardless_of_arrival() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    store.add_message(&id, message("m-3", MessageDirection::Inbound, 30));
    store.add_message(&id, message("m-1", MessageDirection::Inbound, 10));
    store.add_message(&id, message("m-2", MessageDirection::Outbound, 20));

    let ids: Vec<&str> = store.messages(&id).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m-1", "m-2", "m-3"]);
}

#[test]
fn undefined_tags_leave_existing_tags_alone() {
    let mut store = store_with_vip();
    let id = conversation_id();

    let outcome = store.upsert(ConversationPatch::new(id.clone()));
    assert_eq!(outcome, UpsertOutcome::Unchanged);
    let tags: Vec<&String> = store.conversation(&id).expect("conv").tags.iter().collect();
    assert_eq!(tags, ["VIP"]);
}

#[test]
fn empty_values_carry_no_information() {
    let mut store = store_with_vip();
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone());
    patch.customer_name = Some("   ".into());
    patch.assigned_to = Some(String::new());
    patch.tags = Some(vec![String::new()]);

    assert_eq!(store.upsert(patch), UpsertOutcome::Unchanged);
    let conversation = store.conversation(&id).expect("conv");
    assert_eq!(conversation.customer_name, "Ana");
    assert_eq!(conversation.assigned_to.as_deref(), Some("agent-7"));
    assert!(conversation.tags.contains("VIP"));
}

#[test]
fn clear_markers_remove_fields_explicitly() {
    let mut store = store_with_vip();
    let id = conversation_id();
    let patch = ConversationPatch::new(id.clone())
        .clearing(ClearableField::Tags)
        .clearing(ClearableField::AssignedTo);

    assert_eq!(store.upsert(patch), UpsertOutcome::Updated);
    let conversation = store.conversation(&id).expect("conv");
    assert!(conversation.tags.is_empty());
    assert_eq!(conversation.assigned_to, None);
}

#[test]
fn clear_wins_over_value_in_same_patch() {
    let mut store = store_with_vip();
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone()).clearing(ClearableField::AssignedTo);
    patch.assigned_to = Some("agent-9".into());

    store.upsert(patch);
    assert_eq!(store.conversation(&id).expect("conv").assigned_to, None);
}

#[test]
fn upsert_is_idempotent() {
    let mut store = store_with_vip();
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone());
    patch.status = Some(ConversationStatus::Pending);
    patch.tags = Some(vec!["VIP".into(), "billing".into()]);

    assert_eq!(store.upsert(patch.clone()), UpsertOutcome::Updated);
    let snapshot = store.clone();
    assert_eq!(store.upsert(patch), UpsertOutcome::Unchanged);
    assert_eq!(store, snapshot);
}

#[test]
fn contact_patch_starts_from_phone_defaults() {
    let mut store = ConversationStore::new(Some(OWN_PHONE.into()));
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone());
    patch.contact = Some(ContactPatch {
        avatar: Some("https://cdn.example/ana.png".into()),
        ..ContactPatch::default()
    });
    store.upsert(patch);

    let contact = store
        .conversation(&id)
        .and_then(|c| c.contact.clone())
        .expect("contact");
    assert_eq!(contact.phone, "+5214773790184");
    assert_eq!(contact.name, None);
    assert_eq!(contact.avatar.as_deref(), Some("https://cdn.example/ana.png"));
    assert!(store.conversation(&id).expect("conv").needs_contact_data);

    let mut named = ConversationPatch::new(id.clone());
    named.contact = Some(ContactPatch {
        name: Some("Ana Ruiz".into()),
        avatar: Some(String::new()),
        ..ContactPatch::default()
    });
    store.upsert(named);
    let conversation = store.conversation(&id).expect("conv");
    let contact = conversation.contact.as_ref().expect("contact");
    assert_eq!(contact.name.as_deref(), Some("Ana Ruiz"));
    assert_eq!(contact.avatar.as_deref(), Some("https://cdn.example/ana.png"));
    assert!(!conversation.needs_contact_data);
}

#[test]
fn last_message_summary_only_moves_forward() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let newer = message("m-2", MessageDirection::Inbound, 20);
    let older = message("m-1", MessageDirection::Inbound, 10);

    store.upsert(last_message_patch(&newer));
    store.upsert(last_message_patch(&older));

    let conversation = store.conversation(&id).expect("conv");
    assert_eq!(
        conversation.last_message.as_ref().map(|m| m.message_id.as_str()),
        Some("m-2")
    );
    assert_eq!(conversation.last_message_at, Some(at(20)));
}

#[test]
fn unread_prefers_local_messages_over_server_counter() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone());
    patch.unread_count = Some(7);
    store.upsert(patch);
    assert_eq!(store.compute_unread_count(&id), 7);

    store.add_message(&id, message("m-1", MessageDirection::Inbound, 1));
    store.add_message(&id, message("m-2", MessageDirection::Inbound, 2));
    store.add_message(&id, message("m-3", MessageDirection::Outbound, 3));
    assert_eq!(store.compute_unread_count(&id), 2);
}

#[test]
fn unknown_conversation_has_zero_unread() {
    let store = ConversationStore::new(None);
    assert_eq!(store.compute_unread_count(&conversation_id()), 0);
}

#[test]
fn mark_read_is_idempotent_and_zeroes_counter() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    store.add_message(&id, message("m-1", MessageDirection::Inbound, 1));
    store.add_message(&id, message("m-2", MessageDirection::Inbound, 2));
    store.add_message(&id, message("m-3", MessageDirection::Outbound, 3));

    let marked = store.mark_read(&id);
    assert_eq!(marked, vec![MessageId::from("m-1"), MessageId::from("m-2")]);
    assert_eq!(store.compute_unread_count(&id), 0);
    assert_eq!(store.conversation(&id).expect("conv").unread_count, 0);
    assert_eq!(
        store.message(&id, &MessageId::from("m-3")).expect("m-3").status,
        MessageStatus::Sent
    );

    let snapshot = store.clone();
    assert!(store.mark_read(&id).is_empty());
    assert_eq!(store, snapshot);
}

#[test]
fn mark_read_without_local_messages_zeroes_server_counter() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let mut patch = ConversationPatch::new(id.clone());
    patch.unread_count = Some(4);
    store.upsert(patch);

    assert!(store.mark_read(&id).is_empty());
    assert_eq!(store.compute_unread_count(&id), 0);
    assert_eq!(store.read_through(&id), None);
}

#[test]
fn late_message_before_watermark_arrives_read() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    store.add_message(&id, message("m-2", MessageDirection::Inbound, 20));
    store.mark_read(&id);

    store.add_message(&id, message("m-1", MessageDirection::Inbound, 10));
    store.add_message(&id, message("m-3", MessageDirection::Inbound, 30));

    assert_eq!(
        store.message(&id, &MessageId::from("m-1")).expect("m-1").status,
        MessageStatus::Read
    );
    assert_eq!(store.compute_unread_count(&id), 1);
}

#[test]
fn message_status_never_regresses() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let message_id = MessageId::from("m-1");
    store.add_message(&id, message("m-1", MessageDirection::Outbound, 1));

    assert!(store.update_message(&id, &message_id, MessagePatch::status(MessageStatus::Read)));
    assert!(!store.update_message(
        &id,
        &message_id,
        MessagePatch::status(MessageStatus::Delivered)
    ));
    assert!(!store.update_message(&id, &message_id, MessagePatch::status(MessageStatus::Failed)));
    assert_eq!(
        store.message(&id, &message_id).expect("message").status,
        MessageStatus::Read
    );
}

#[test]
fn update_message_merges_metadata() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let message_id = MessageId::from("m-1");
    let mut original = message("m-1", MessageDirection::Outbound, 1);
    original.metadata.insert("source".into(), json!("agent"));
    store.add_message(&id, original);

    let mut patch = MessagePatch::default();
    patch.metadata.insert("provider".into(), json!("meta"));
    assert!(store.update_message(&id, &message_id, patch.clone()));
    assert!(!store.update_message(&id, &message_id, patch));

    let metadata = &store.message(&id, &message_id).expect("message").metadata;
    assert_eq!(metadata.get("source"), Some(&json!("agent")));
    assert_eq!(metadata.get("provider"), Some(&json!("meta")));
}

#[test]
fn update_of_unknown_message_is_noop() {
    let mut store = ConversationStore::new(None);
    assert!(!store.update_message(
        &conversation_id(),
        &MessageId::from("nope"),
        MessagePatch::status(MessageStatus::Read)
    ));
}

#[test]
fn acknowledge_replaces_local_message() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let local_id = MessageId::local();
    let mut local = message("placeholder", MessageDirection::Outbound, 5);
    local.id = local_id.clone();
    store.add_message(&id, local);

    let mut server = message("wamid-1", MessageDirection::Outbound, 6);
    server.status = MessageStatus::Delivered;
    assert!(store.acknowledge(&id, &local_id, server.clone()));

    let ids: Vec<&str> = store.messages(&id).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["wamid-1"]);
    assert_eq!(store.messages(&id)[0].status, MessageStatus::Delivered);

    assert!(!store.acknowledge(&id, &local_id, server));
    assert_eq!(store.messages(&id).len(), 1);
}

#[test]
fn late_copy_of_settled_local_message_is_duplicate() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();
    let local_id = MessageId::local();
    let mut local = message("placeholder", MessageDirection::Outbound, 5);
    local.id = local_id.clone();

    store.acknowledge(&id, &local_id, message("wamid-1", MessageDirection::Outbound, 6));
    assert_eq!(store.add_message(&id, local), AddOutcome::Duplicate);

    let ids: Vec<&str> = store.messages(&id).iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["wamid-1"]);
}

#[test]
fn set_active_creates_placeholder_and_reports_changes() {
    let mut store = ConversationStore::new(None);
    let id = conversation_id();

    assert!(store.set_active(Some(id.clone())));
    assert!(!store.set_active(Some(id.clone())));
    assert_eq!(store.active().map(|c| &c.id), Some(&id));
    assert!(store.set_active(None));
    assert_eq!(store.active_id(), None);
}

#[test]
fn conversations_sort_by_recent_activity() {
    let mut store = ConversationStore::new(None);
    let quiet: ConversationId = "conv_+1_+2".parse().expect("id");
    let busy: ConversationId = "conv_+3_+2".parse().expect("id");
    store.upsert(ConversationPatch::new(quiet.clone()));

    let mut recent = message("m-1", MessageDirection::Inbound, 50);
    recent.conversation_id = busy.clone();
    store.add_message(&busy, recent.clone());
    store.upsert(last_message_patch(&recent));

    let order: Vec<&ConversationId> = store
        .conversations_by_recency()
        .into_iter()
        .map(|c| &c.id)
        .collect();
    assert_eq!(order, [&busy, &quiet]);
    assert_eq!(store.total_unread(), 1);
}
