//! Actor board: the directed graph controlling who may send what to whom.

pub mod resolver;
pub mod types;

pub use resolver::{may_claim_actor, resolve};
pub use types::{
    ActorBoard, ActorKind, ActorLink, ActorNode, ActorTeam, CommunicationType, LinkDirection,
};

use crate::error::Result;
use crate::persist::{AggregateKind, Backend};
use anyhow::Context as _;
use std::sync::Arc;

/// The board is a single root aggregate under a fixed id.
const BOARD_ID: &str = "board";

pub struct BoardStore {
    backend: Arc<dyn Backend>,
}

impl BoardStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// The current board; empty when never written.
    pub async fn get(&self) -> Result<ActorBoard> {
        let Some(body) = self
            .backend
            .get_aggregate(AggregateKind::ActorBoard, BOARD_ID)
            .await?
        else {
            return Ok(ActorBoard::default());
        };
        serde_json::from_value(body)
            .context("failed to decode actor board")
            .map_err(Into::into)
    }

    /// Replace the board, bumping its version.
    pub async fn put(&self, mut board: ActorBoard) -> Result<ActorBoard> {
        board.version += 1;
        board.updated_at = chrono::Utc::now();
        self.backend
            .put_aggregate(
                AggregateKind::ActorBoard,
                BOARD_ID,
                serde_json::to_value(&board).context("failed to encode actor board")?,
            )
            .await?;
        Ok(board)
    }
}
