//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use cohort_core::{
    ApplicationPart, DataExchangePart, ExchangeEntry, GroupId, Message, MessagePart, NodeId,
    ProviderId, StateTransferResponse,
};

/// Generate a random NodeId.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<u128>().prop_map(NodeId::from_u128)
}

/// Generate a random ProviderId.
pub fn provider_id() -> impl Strategy<Value = ProviderId> {
    any::<u128>().prop_map(ProviderId::from_u128)
}

/// Generate a group name.
pub fn group_id() -> impl Strategy<Value = GroupId> {
    "[a-z][a-z0-9-]{0,15}".prop_map(GroupId::new)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate application traffic.
pub fn application_part() -> impl Strategy<Value = ApplicationPart> {
    ("[a-z]{1,8}", payload(64)).prop_map(|(kind, payload)| ApplicationPart { kind, payload })
}

/// Generate a ring exchange payload.
pub fn data_exchange_part() -> impl Strategy<Value = DataExchangePart> {
    let entry = (node_id(), 1i64..=i64::MAX, payload(32))
        .prop_map(|(node, id, data)| ExchangeEntry { node, id, data });
    prop::collection::btree_map(provider_id(), prop::collection::vec(entry, 0..4), 0..3)
        .prop_map(|providers: BTreeMap<_, _>| DataExchangePart { providers })
}

/// Generate any message part.
pub fn message_part() -> impl Strategy<Value = MessagePart> {
    prop_oneof![
        Just(MessagePart::StateTransferRequest),
        any::<(bool, bool)>().prop_map(|(snapshot, last)| {
            MessagePart::StateTransferResponse(StateTransferResponse {
                snapshot,
                last,
                failed: false,
                file: Some(format!("/tmp/transfer-{snapshot}-{last}.tmp").into()),
            })
        }),
        data_exchange_part().prop_map(MessagePart::DataExchange),
        application_part().prop_map(MessagePart::Application),
    ]
}

/// Generate a message multicast to `group`.
pub fn group_message(group: GroupId) -> impl Strategy<Value = Message> {
    (node_id(), application_part(), any::<bool>()).prop_map(move |(source, part, urgent)| {
        let message = Message::to_group(source, group.clone(), MessagePart::Application(part));
        if urgent {
            message.with_high_priority()
        } else {
            message
        }
    })
}

/// Generate a message of any kind to any destination.
pub fn message() -> impl Strategy<Value = Message> {
    (node_id(), prop::option::of(node_id()), group_id(), message_part()).prop_map(
        |(source, target, group, part)| match target {
            Some(target) => Message::to_node(source, target, part),
            None => Message::to_group(source, group, part),
        },
    )
}

/// Generate a non-empty batch of messages.
pub fn messages(max_len: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message(), 1..=max_len.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Instant;

    use cohort_store::{CborSerializer, MemoryStateStore, MessageLogCodec};
    use cohort_sync::task::ManualTaskExecutor;
    use cohort_sync::transport::memory::{RecordingReceiver, RecordingSender};
    use cohort_sync::{
        Collaborators, StateTransferConfig, StateTransferServerProtocol, TransferContext,
    };

    use crate::fixtures::{membership, KvApp, RecordingFlowController};

    fn codec() -> MessageLogCodec {
        MessageLogCodec::new(Arc::new(CborSerializer))
    }

    proptest! {
        #[test]
        fn log_image_round_trips(batch in messages(16)) {
            let codec = codec();
            let image = codec.encode(&batch).unwrap();
            prop_assert_eq!(codec.decode(&image).unwrap(), batch);
        }

        #[test]
        fn group_messages_target_their_group(
            (group, message) in group_id().prop_flat_map(|group| (Just(group.clone()), group_message(group)))
        ) {
            prop_assert!(message.targets_group(&group));
            prop_assert!(matches!(message.part, MessagePart::Application(_)));
        }

        #[test]
        fn exchange_entries_have_positive_ids(part in data_exchange_part()) {
            for entry in part.providers.values().flatten() {
                prop_assert!(entry.id > 0);
            }
        }

        #[test]
        fn held_messages_replay_in_arrival_order(count in 1usize..40) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let dir = tempfile::tempdir().unwrap();
            let group = GroupId::new("orders");
            let app = KvApp::new();
            let executor = Rc::new(ManualTaskExecutor::new());
            let receiver = Rc::new(RecordingReceiver::new());
            let context = TransferContext::new(
                NodeId::from_u128(1),
                group.clone(),
                StateTransferConfig::default().with_work_dir(dir.path()),
                codec(),
                Collaborators {
                    server_app: Arc::new(app.clone()),
                    client_app: Arc::new(app),
                    store: Arc::new(MemoryStateStore::new()),
                    executor: executor.clone(),
                    sender: Rc::new(RecordingSender::new()),
                },
            )
            .unwrap();
            let mut server = StateTransferServerProtocol::new(
                context,
                receiver.clone(),
                Rc::new(RecordingFlowController::new()),
            );
            server.on_membership_changed(membership(1, &[1, 2]));

            let now = Instant::now();
            server.receive(
                Message::to_node(NodeId::from_u128(3), NodeId::from_u128(1), MessagePart::StateTransferRequest),
                now,
            );
            let sent: Vec<Message> = (0..count)
                .map(|i| crate::fixtures::put(2, &group, &format!("k{i}"), "v"))
                .collect();
            for message in &sent {
                server.receive(message.clone(), now);
            }
            prop_assert_eq!(server.pending_len(), count);
            prop_assert!(receiver.received().is_empty());

            let completion = runtime.block_on(executor.run_next()).unwrap();
            prop_assert!(server.on_task_completed(completion, now).is_none());
            prop_assert_eq!(receiver.take(), sent);
        }
    }
}
