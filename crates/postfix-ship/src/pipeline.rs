// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::coordinator::{BatchState, CycleOutcome};
use crate::errors::PipelineError;
use crate::flow::{FlowController, FlowSignal};
use crate::reader::{LineReader, ReaderEvent};
use crate::tokenizer::{Tokenized, Tokenizer};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// Shutdown was requested
    Stopped,
    /// The reader has no more input and everything read was committed
    InputClosed,
}

/// Producer loop: reader -> tokenizer -> flow controller -> coordinator.
pub struct Pipeline<R, T> {
    reader: R,
    tokenizer: T,
    flow: FlowController,
    shutdown: CancellationToken,
}

impl<R, T> Pipeline<R, T>
where
    R: LineReader,
    T: Tokenizer,
{
    pub fn new(reader: R, tokenizer: T, flow: FlowController, shutdown: CancellationToken) -> Self {
        Pipeline {
            reader,
            tokenizer,
            flow,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchState> {
        self.flow.subscribe()
    }

    pub async fn run(mut self) -> Result<PipelineExit, PipelineError> {
        info!("PIPELINE | Started");
        loop {
            let event = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    info!("PIPELINE | Stopped reading, {} records pending", self.flow.pending_len());
                    return Ok(PipelineExit::Stopped);
                }
                event = self.reader.next_event() => event?,
            };

            let outcome = match event {
                ReaderEvent::Line(line) => {
                    let record = match self.tokenizer.tokenize(&line) {
                        Tokenized::Record(record) => record,
                        Tokenized::NotApplicable => continue,
                        Tokenized::Malformed { subsystem, detail } => {
                            error!("PARSE ERROR for {}: {} in {:?}", subsystem, detail, line);
                            continue;
                        }
                    };
                    match self.flow.push(record, &self.shutdown).await {
                        FlowSignal::Continue => continue,
                        FlowSignal::Cycle(outcome) => outcome,
                        FlowSignal::Refused(_) => return Ok(PipelineExit::Stopped),
                    }
                }
                ReaderEvent::Batch => self.flow.input_drained(&self.shutdown).await,
                ReaderEvent::Closed => {
                    let outcome = self.flow.input_drained(&self.shutdown).await;
                    return Ok(self
                        .settle(outcome)
                        .await?
                        .unwrap_or(PipelineExit::InputClosed));
                }
            };

            if let Some(exit) = self.settle(outcome).await? {
                return Ok(exit);
            }
        }
    }

    /// Acts on the result of a batch cycle. Returns an exit when reading
    /// must stop.
    async fn settle(&mut self, outcome: CycleOutcome) -> Result<Option<PipelineExit>, PipelineError> {
        match outcome {
            CycleOutcome::Empty => {
                self.reader.resume().await?;
                Ok(None)
            }
            CycleOutcome::Committed { resume_after, .. } => {
                self.reader.resume().await?;
                if !resume_after.is_zero() {
                    debug!("PIPELINE | Waiting {:?} before the next batch", resume_after);
                    tokio::select! {
                        () = sleep(resume_after) => {}
                        () = self.shutdown.cancelled() => {}
                    }
                }
                Ok(None)
            }
            CycleOutcome::Refused(state) => {
                warn!("PIPELINE | Coordinator refused the batch while {:?}", state);
                Ok(Some(PipelineExit::Stopped))
            }
            CycleOutcome::Interrupted { .. } => Ok(Some(PipelineExit::Stopped)),
            CycleOutcome::Fatal { attempts, error } => Err(PipelineError::RetriesExhausted {
                attempts,
                source: error,
            }),
        }
    }
}
