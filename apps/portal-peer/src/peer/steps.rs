//! Per-connection negotiation worker.
//!
//! Every connection owns one task that opens the link and then runs the
//! connection's negotiation steps strictly in the order they were queued.
//! Results come back to the coordinator as [`LinkEventKind::StepFinished`],
//! tagged like any other link callback, so a step that never completes only
//! holds up its own connection.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::connection::StepGuard;
use crate::error::PeerError;
use crate::link::{Channel, Connector, Link, LinkContext, LinkEventKind, LinkRequest};
use crate::protocol::{IceCandidate, SessionDescription};

/// One unit of negotiation work for a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    /// Applies a remote offer, then creates the answer to it.
    AnswerOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    OpenChannel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Open,
    Offer,
    Answer,
    ApplyAnswer,
    Candidate,
    OpenChannel,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::CreateOffer => StepKind::Offer,
            Step::AnswerOffer(_) => StepKind::Answer,
            Step::ApplyAnswer(_) => StepKind::ApplyAnswer,
            Step::AddCandidate(_) => StepKind::Candidate,
            Step::OpenChannel(_) => StepKind::OpenChannel,
        }
    }
}

pub enum StepOutcome {
    LinkReady,
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    AnswerApplied,
    CandidateAdded,
    ChannelCreated(Arc<dyn Channel>),
    Failed { step: StepKind, error: PeerError },
}

impl fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::LinkReady => f.write_str("LinkReady"),
            StepOutcome::OfferCreated(_) => f.write_str("OfferCreated"),
            StepOutcome::AnswerCreated(_) => f.write_str("AnswerCreated"),
            StepOutcome::AnswerApplied => f.write_str("AnswerApplied"),
            StepOutcome::CandidateAdded => f.write_str("CandidateAdded"),
            StepOutcome::ChannelCreated(channel) => f
                .debug_tuple("ChannelCreated")
                .field(&channel.label())
                .finish(),
            StepOutcome::Failed { step, error } => f
                .debug_struct("Failed")
                .field("step", step)
                .field("error", &error.to_string())
                .finish(),
        }
    }
}

/// Sending half of a connection's step worker. Dropping it, or cancelling
/// the worker's guard, ends the worker and closes the link.
pub struct StepQueue {
    steps: mpsc::UnboundedSender<Step>,
}

impl StepQueue {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        request: LinkRequest,
        guard: StepGuard,
    ) -> (Self, JoinHandle<()>) {
        let (steps, queued) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_steps(connector, request, guard, queued));
        (Self { steps }, worker)
    }

    pub fn push(&self, step: Step) {
        if let Err(rejected) = self.steps.send(step) {
            trace!(target = "portal", step = ?rejected.0.kind(), "step worker gone; step dropped");
        }
    }
}

async fn run_steps(
    connector: Arc<dyn Connector>,
    request: LinkRequest,
    guard: StepGuard,
    mut queued: mpsc::UnboundedReceiver<Step>,
) {
    let context = request.context.clone();
    let link = match guard.run("open connection", connector.open(request)).await {
        Ok(link) => link,
        Err(error) => {
            finish(&context, StepOutcome::Failed { step: StepKind::Open, error });
            return;
        }
    };
    finish(&context, StepOutcome::LinkReady);

    loop {
        let step = tokio::select! {
            biased;
            _ = guard.cancelled() => break,
            step = queued.recv() => match step {
                Some(step) => step,
                None => break,
            },
        };
        let outcome = execute(link.as_ref(), &guard, step).await;
        finish(&context, outcome);
    }

    debug!(target = "portal", peer = %context.peer(), generation = context.generation(), "closing link");
    link.close().await;
}

async fn execute(link: &dyn Link, guard: &StepGuard, step: Step) -> StepOutcome {
    let kind = step.kind();
    let result = match step {
        Step::CreateOffer => guard
            .run("create offer", link.create_offer())
            .await
            .map(StepOutcome::OfferCreated),
        Step::AnswerOffer(offer) => {
            match guard
                .run("apply remote offer", link.apply_remote_description(offer))
                .await
            {
                Ok(()) => guard
                    .run("create answer", link.create_answer())
                    .await
                    .map(StepOutcome::AnswerCreated),
                Err(err) => Err(err),
            }
        }
        Step::ApplyAnswer(answer) => guard
            .run("apply remote answer", link.apply_remote_description(answer))
            .await
            .map(|()| StepOutcome::AnswerApplied),
        Step::AddCandidate(candidate) => guard
            .run("add remote candidate", link.add_candidate(candidate))
            .await
            .map(|()| StepOutcome::CandidateAdded),
        Step::OpenChannel(label) => guard
            .run("open data channel", link.open_channel(&label))
            .await
            .map(StepOutcome::ChannelCreated),
    };
    result.unwrap_or_else(|error| StepOutcome::Failed { step: kind, error })
}

fn finish(context: &LinkContext, outcome: StepOutcome) {
    context.emit(LinkEventKind::StepFinished(outcome));
}
