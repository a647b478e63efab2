//! Reconnection controller.
//!
//! One controller per connection guarantees at most one reconnection
//! sequence at a time.
//!
//! ```text
//!            begin / restart            advance (attempts == limit)
//!   Idle ───────────────────► Reconnecting ──────────────────► Exhausted
//!    ▲                           │    ▲  │                          │
//!    │      settle / cancel      │    └──┘ advance (dial)           │
//!    ├───────────────────────────┘                                  │
//!    └──────────────────── restart / settle / cancel ───────────────┘
//! ```

use std::fmt;

use super::config::BackoffPolicy;
use super::timer::Deadline;

/// Where the controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPhase {
    /// No sequence running.
    #[default]
    Idle,
    /// A sequence is running; `attempts` dials issued so far.
    Reconnecting { attempts: u32 },
    /// The last sequence used up its attempts without the connection
    /// opening.
    Exhausted { attempts: u32 },
}

impl fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Reconnecting { attempts } => write!(f, "Reconnecting ({attempts})"),
            Self::Exhausted { attempts } => write!(f, "Exhausted ({attempts})"),
        }
    }
}

/// What the connection should do on this step of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Dial again; this is attempt number `attempt`.
    Dial { attempt: u32 },
    /// The sequence just ran out of attempts.
    Exhausted { attempts: u32 },
    /// Nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct ReconnectController {
    phase: ReconnectPhase,
    limit: u32,
    backoff: BackoffPolicy,
    deadline: Deadline,
}

impl ReconnectController {
    pub fn new(limit: u32, backoff: BackoffPolicy) -> Self {
        Self {
            phase: ReconnectPhase::Idle,
            limit,
            backoff,
            deadline: Deadline::default(),
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Start a sequence from `Idle`. Returns `false` when one is already
    /// running or the last one was exhausted.
    pub fn begin(&mut self) -> bool {
        match self.phase {
            ReconnectPhase::Idle => {
                self.phase = ReconnectPhase::Reconnecting { attempts: 0 };
                true
            }
            _ => false,
        }
    }

    /// Start a sequence from `Idle` or `Exhausted`. Returns `false` when
    /// one is already running.
    pub fn restart(&mut self) -> bool {
        match self.phase {
            ReconnectPhase::Idle | ReconnectPhase::Exhausted { .. } => {
                self.phase = ReconnectPhase::Reconnecting { attempts: 0 };
                true
            }
            ReconnectPhase::Reconnecting { .. } => false,
        }
    }

    /// Move the running sequence forward and arm the next deadline.
    pub fn advance(&mut self) -> Step {
        let ReconnectPhase::Reconnecting { attempts } = self.phase else {
            self.deadline.cancel();
            return Step::Idle;
        };

        if attempts < self.limit {
            let attempt = attempts + 1;
            self.phase = ReconnectPhase::Reconnecting { attempts: attempt };
            self.deadline.arm(self.backoff.delay(attempt));
            Step::Dial { attempt }
        } else {
            self.phase = ReconnectPhase::Exhausted { attempts };
            self.deadline.cancel();
            Step::Exhausted { attempts }
        }
    }

    /// The connection opened; drop any sequence.
    pub fn settle(&mut self) {
        self.phase = ReconnectPhase::Idle;
        self.deadline.cancel();
    }

    /// A session was handed over from outside; drop any sequence.
    pub fn cancel(&mut self) {
        self.settle();
    }

    /// Resolves when the next step is due.
    pub async fn elapsed(&self) {
        self.deadline.elapsed().await
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}
