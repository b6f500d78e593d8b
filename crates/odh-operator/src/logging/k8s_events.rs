//! Warning events for failed reconciliations.

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder, Reporter},
};
use tracing::Instrument;

use super::controller::ReconcilerError;
use crate::{client::Client, errors::full_message};

/// The longest note the API server accepts for an event.
const MAX_NOTE_LEN: usize = 1024;
const ELLIPSIS: char = '…';

fn error_to_event<E: ReconcilerError + 'static>(err: &E) -> Event {
    let mut note = full_message(err);
    truncate_note(&mut note, MAX_NOTE_LEN);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: err.secondary_object().map(ObjectReference::from),
    }
}

/// Cuts `note` down to at most `max_len` bytes on a character boundary. A
/// shortened note ends with an ellipsis.
fn truncate_note(note: &mut String, max_len: usize) {
    if note.len() <= max_len {
        return;
    }

    let budget = max_len.saturating_sub(ELLIPSIS.len_utf8());
    let end = note
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|&index| index <= budget)
        .last()
        .unwrap_or_default();
    note.truncate(end);
    if ELLIPSIS.len_utf8() <= max_len {
        note.push(ELLIPSIS);
    }
}

/// Records a failed reconciliation as a Warning event on the instance.
///
/// Queue and watch failures are not tied to an instance and only get logged by
/// the caller. The event is sent in the background.
#[tracing::instrument(skip(client))]
pub fn publish_reconcile_failure<ReconcileErr, QueueErr>(
    client: &Client,
    controller: &str,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error,
{
    let controller::Error::ReconcilerFailed(error, obj) = controller_error else {
        return;
    };
    let recorder = Recorder::new(client.as_kube_client(), Reporter {
        controller: controller.to_string(),
        instance: None,
    });
    let event = error_to_event(error);
    let reference = ObjectReference::from(obj.clone());

    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to report error as Kubernetes event"
                );
            }
        }
        .in_current_span(),
    );
}
