//! Domain events emitted on every occupation change.
//!
//! Events go to the append-only audit log and, best effort, to the realtime
//! publisher. Each kind carries only the payload that makes sense for it and
//! is validated when the envelope is built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::spool::{SpoolId, SubUnitId, WorkerId};
use crate::model::track::Track;

/// An event envelope with the fields every audit row carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub resource_id: SpoolId,
    pub worker: WorkerId,
    pub track: Option<Track>,
    pub timestamp: DateTime<Utc>,
    /// Shared by every event produced by the same inbound request.
    pub correlation_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "detail", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Paused {
        completed: Vec<SubUnitId>,
        remaining: usize,
    },
    Completed {
        completed: Vec<SubUnitId>,
    },
    Cancelled,
    SubUnitCompleted {
        sub_unit: SubUnitId,
        size: f64,
    },
    ReworkReopened {
        cycle: u32,
    },
    BlockedEscalated {
        cycle: u32,
        bound: u32,
    },
    DownstreamQueueTriggered,
    /// The previous holder's session ended without a Stop and the spool was
    /// taken over. `reason` is "stale" or "lock_expired".
    SessionAbandoned {
        holder: WorkerId,
        held_since: Option<DateTime<Utc>>,
        reason: String,
    },
}

impl EventKind {
    /// Wire name, matching the serialized `event_type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Paused { .. } => "paused",
            EventKind::Completed { .. } => "completed",
            EventKind::Cancelled => "cancelled",
            EventKind::SubUnitCompleted { .. } => "sub_unit_completed",
            EventKind::ReworkReopened { .. } => "rework_reopened",
            EventKind::BlockedEscalated { .. } => "blocked_escalated",
            EventKind::DownstreamQueueTriggered => "downstream_queue_triggered",
            EventKind::SessionAbandoned { .. } => "session_abandoned",
        }
    }

    /// Downstream triggers and takeovers are spool-wide; everything else is
    /// track-scoped.
    fn requires_track(&self) -> bool {
        !matches!(
            self,
            EventKind::DownstreamQueueTriggered | EventKind::SessionAbandoned { .. }
        )
    }

    fn validate(&self) -> Result<()> {
        match self {
            EventKind::Paused {
                completed,
                remaining,
            } => {
                if completed.is_empty() {
                    return Err(Error::InvalidEvent(
                        "paused event must record at least one sub-unit".to_string(),
                    ));
                }
                if *remaining == 0 {
                    return Err(Error::InvalidEvent(
                        "paused event with nothing remaining should be completed".to_string(),
                    ));
                }
            }
            EventKind::Completed { completed } if completed.is_empty() => {
                return Err(Error::InvalidEvent(
                    "completed event must record at least one sub-unit".to_string(),
                ));
            }
            EventKind::SubUnitCompleted { size, .. } if !size.is_finite() || *size < 0.0 => {
                return Err(Error::InvalidEvent(format!("invalid sub-unit size {size}")));
            }
            EventKind::ReworkReopened { cycle } if *cycle == 0 => {
                return Err(Error::InvalidEvent(
                    "rework reopen must carry a cycle >= 1".to_string(),
                ));
            }
            EventKind::BlockedEscalated { cycle, bound } if cycle < bound => {
                return Err(Error::InvalidEvent(format!(
                    "blocked escalation at cycle {cycle} below bound {bound}"
                )));
            }
            EventKind::SessionAbandoned { holder, .. } if holder.as_str().trim().is_empty() => {
                return Err(Error::InvalidEvent(
                    "abandoned session must name its holder".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Event {
    /// Build and validate an event.
    pub fn new(
        kind: EventKind,
        resource_id: &SpoolId,
        worker: &WorkerId,
        track: Option<Track>,
        correlation_id: Uuid,
    ) -> Result<Self> {
        if resource_id.as_str().trim().is_empty() {
            return Err(Error::InvalidEvent("empty resource id".to_string()));
        }
        if worker.as_str().trim().is_empty() {
            return Err(Error::InvalidEvent("empty worker id".to_string()));
        }
        if kind.requires_track() && track.is_none() {
            return Err(Error::InvalidEvent(format!(
                "{} event requires a track",
                kind.event_type()
            )));
        }
        kind.validate()?;

        Ok(Self {
            resource_id: resource_id.clone(),
            worker: worker.clone(),
            track,
            timestamp: Utc::now(),
            correlation_id,
            kind,
        })
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// Payload-only view for the audit `detail` column.
    pub fn detail(&self) -> serde_json::Value {
        match serde_json::to_value(&self.kind) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("detail").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (SpoolId, WorkerId) {
        ("R-1".into(), "w1".into())
    }

    #[test]
    fn serializes_with_event_type_tag() {
        let (spool, worker) = ids();
        let event = Event::new(
            EventKind::ReworkReopened { cycle: 2 },
            &spool,
            &worker,
            Some(Track::Welding),
            Uuid::new_v4(),
        )
        .unwrap();

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "rework_reopened");
        assert_eq!(json["detail"]["cycle"], 2);
        assert_eq!(event.detail()["cycle"], 2);
    }

    #[test]
    fn rejects_blank_worker() {
        let (spool, _) = ids();
        let err = Event::new(
            EventKind::Started,
            &spool,
            &WorkerId::new("  "),
            Some(Track::Assembly),
            Uuid::new_v4(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));
    }

    #[test]
    fn track_scoped_events_need_a_track() {
        let (spool, worker) = ids();
        assert!(Event::new(EventKind::Started, &spool, &worker, None, Uuid::new_v4()).is_err());
        assert!(
            Event::new(
                EventKind::DownstreamQueueTriggered,
                &spool,
                &worker,
                None,
                Uuid::new_v4()
            )
            .is_ok()
        );

        let abandoned = EventKind::SessionAbandoned {
            holder: "gone".into(),
            held_since: None,
            reason: "stale".to_string(),
        };
        let event = Event::new(abandoned, &spool, &worker, None, Uuid::new_v4()).unwrap();
        assert_eq!(event.event_type(), "session_abandoned");
        assert_eq!(event.detail()["holder"], "gone");
    }

    #[test]
    fn paused_requires_progress_and_remainder() {
        let (spool, worker) = ids();
        let empty = EventKind::Paused {
            completed: vec![],
            remaining: 2,
        };
        assert!(Event::new(empty, &spool, &worker, Some(Track::Assembly), Uuid::new_v4()).is_err());

        let done = EventKind::Paused {
            completed: vec!["J1".into()],
            remaining: 0,
        };
        assert!(Event::new(done, &spool, &worker, Some(Track::Assembly), Uuid::new_v4()).is_err());
    }
}
