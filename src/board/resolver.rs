//! Recipient resolution over the actor graph.

use super::types::{ActorBoard, CommunicationType, LinkDirection};

/// Resolve the recipients reachable from `from_actor_id`.
///
/// A target is included when the link's communication type matches the filter
/// (or the filter is absent) and the link is outgoing `one_way` or `two_way`.
/// `two_way` links are also walked in reverse when the queried node is the
/// target. The result is deduplicated and in stable lexicographic order.
pub fn resolve(
    board: &ActorBoard,
    from_actor_id: &str,
    communication_type: Option<CommunicationType>,
) -> Vec<String> {
    let mut recipients: Vec<String> = board
        .links
        .iter()
        .filter(|link| {
            communication_type.is_none_or(|filter| link.communication_type == filter)
        })
        .filter_map(|link| {
            if link.source == from_actor_id {
                Some(link.target.clone())
            } else if link.target == from_actor_id && link.direction == LinkDirection::TwoWay {
                Some(link.source.clone())
            } else {
                None
            }
        })
        .collect();

    recipients.sort();
    recipients.dedup();
    recipients
}

/// The dispatcher's well-known node id for task-claim gating.
pub const DISPATCHER_ACTOR_ID: &str = "human:dispatcher";

/// Whether a task naming `actor_id` may be claimed: the board's directed
/// `task` links must permit `human:dispatcher → actor`.
pub fn may_claim_actor(board: &ActorBoard, actor_id: &str) -> bool {
    resolve(board, DISPATCHER_ACTOR_ID, Some(CommunicationType::Task))
        .iter()
        .any(|recipient| recipient == actor_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::types::{ActorKind, ActorLink, ActorNode};

    fn board() -> ActorBoard {
        let mut board = ActorBoard::default();
        board.nodes = vec![
            ActorNode {
                id: "human:dispatcher".into(),
                kind: ActorKind::Human,
                label: "Dispatcher".into(),
                agent_id: None,
            },
            ActorNode {
                id: "agent:scribe".into(),
                kind: ActorKind::Agent,
                label: "Scribe".into(),
                agent_id: Some("scribe".into()),
            },
            ActorNode {
                id: "agent:builder".into(),
                kind: ActorKind::Agent,
                label: "Builder".into(),
                agent_id: Some("builder".into()),
            },
        ];
        board.links = vec![
            ActorLink {
                source: "human:dispatcher".into(),
                target: "agent:scribe".into(),
                direction: LinkDirection::OneWay,
                communication_type: CommunicationType::Task,
                source_socket: Some("bottom".into()),
                target_socket: Some("top".into()),
            },
            ActorLink {
                source: "agent:builder".into(),
                target: "agent:scribe".into(),
                direction: LinkDirection::TwoWay,
                communication_type: CommunicationType::Chat,
                source_socket: None,
                target_socket: None,
            },
        ];
        board
    }

    #[test]
    fn outgoing_one_way_resolves_forward_only() {
        let board = board();
        assert_eq!(
            resolve(&board, "human:dispatcher", Some(CommunicationType::Task)),
            vec!["agent:scribe".to_string()]
        );
        // The reverse direction is not reachable over a one_way link.
        assert!(resolve(&board, "agent:scribe", Some(CommunicationType::Task)).is_empty());
    }

    #[test]
    fn two_way_resolves_from_either_endpoint() {
        let board = board();
        assert_eq!(
            resolve(&board, "agent:builder", Some(CommunicationType::Chat)),
            vec!["agent:scribe".to_string()]
        );
        assert_eq!(
            resolve(&board, "agent:scribe", Some(CommunicationType::Chat)),
            vec!["agent:builder".to_string()]
        );
    }

    #[test]
    fn no_filter_includes_all_types_sorted_deduped() {
        let mut board = board();
        // Duplicate edge with a different type; the target appears once.
        board.links.push(ActorLink {
            source: "human:dispatcher".into(),
            target: "agent:scribe".into(),
            direction: LinkDirection::OneWay,
            communication_type: CommunicationType::Event,
            source_socket: None,
            target_socket: None,
        });
        let recipients = resolve(&board, "human:dispatcher", None);
        assert_eq!(recipients, vec!["agent:scribe".to_string()]);
    }

    #[test]
    fn claim_gate_follows_task_links() {
        let board = board();
        assert!(may_claim_actor(&board, "agent:scribe"));
        assert!(!may_claim_actor(&board, "agent:builder"));
    }
}
