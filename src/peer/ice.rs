use std::collections::VecDeque;
use std::mem;

use crate::peer::types::IceCandidate;

/// Remote candidates received before the remote description was set.
///
/// Candidates are held in arrival order until [`retire`](Self::retire) is
/// called, after which [`push`](Self::push) hands every candidate straight
/// back for immediate application.
#[derive(Debug)]
pub enum CandidateBuffer {
    Buffering(VecDeque<IceCandidate>),
    Retired,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::Buffering(VecDeque::new())
    }

    /// Returns the candidate back when it can be applied now.
    #[must_use]
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self {
            Self::Buffering(queue) => {
                queue.push_back(candidate);
                None
            }
            Self::Retired => Some(candidate),
        }
    }

    /// Drains the buffered candidates in arrival order and stops buffering.
    pub fn retire(&mut self) -> Vec<IceCandidate> {
        match mem::replace(self, Self::Retired) {
            Self::Buffering(queue) => queue.into(),
            Self::Retired => Vec::new(),
        }
    }

    pub fn is_retired(&self) -> bool {
        matches!(self, Self::Retired)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Buffering(queue) => queue.len(),
            Self::Retired => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything, used on teardown.
    pub fn clear(&mut self) {
        if let Self::Buffering(queue) = self {
            queue.clear();
        }
    }
}

/// Counts of gathered local candidates by type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        let c = &candidate.candidate;
        if c.contains("typ host") {
            self.host += 1;
        } else if c.contains("typ srflx") {
            self.srflx += 1;
        } else if c.contains("typ relay") {
            self.relay += 1;
        } else {
            self.other += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }
}
