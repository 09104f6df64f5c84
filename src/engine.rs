use crate::evaluator::{CheckResult, CheckStatus};
use crate::state::{CheckState, StateStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Alert,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub kind: EventKind,
    pub check_id: String,
    pub result: CheckResult,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Recovered => "recovered",
        }
    }
}

/// Алерт срабатывает один раз, когда серия алертных замеров впервые
/// достигает `min_consecutive`. Восстановление сообщается на первом
/// нормальном замере после любого алертного.
pub fn transition(
    result: &CheckResult,
    prior: Option<&CheckState>,
    min_consecutive: u32,
    now_unix: i64,
) -> (CheckState, Option<TransitionEvent>) {
    let prior_status = prior.map(|s| s.status).unwrap_or(StateStatus::Unknown);
    let prior_count = prior.map(|s| s.consecutive).unwrap_or(0);

    let (status, consecutive, kind) = match result.status {
        CheckStatus::Alert => {
            let consecutive = if prior_status == StateStatus::Alert {
                prior_count.saturating_add(1)
            } else {
                1
            };
            let already_reported =
                prior_status == StateStatus::Alert && prior_count >= min_consecutive;
            let fire = !already_reported && consecutive >= min_consecutive;
            (StateStatus::Alert, consecutive, fire.then_some(EventKind::Alert))
        }
        CheckStatus::Ok => {
            let consecutive = u32::from(prior_status == StateStatus::Ok);
            let fire = prior_status == StateStatus::Alert;
            (StateStatus::Ok, consecutive, fire.then_some(EventKind::Recovered))
        }
    };

    let state = CheckState {
        status,
        consecutive,
        last_value: Some(result.value),
        last_ts: Some(now_unix),
        message: result.message.clone(),
    };
    let event = kind.map(|kind| TransitionEvent {
        kind,
        check_id: result.check_id.clone(),
        result: result.clone(),
    });
    (state, event)
}
