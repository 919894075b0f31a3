//! Plan selection for a completed (or about to complete) unit

use crate::model::{PlanItem, PlanStatus, ScanOutcome};

/// Which plan a unit of a part counts toward, or why it cannot be counted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Plan {
        plan_id: i64,
        /// The plan is not ACTIVE yet and is promoted on completion
        activate: bool,
        target_rate: i64,
    },
    /// No plan for the part and plans are not required
    Unplanned,
    Rejected(ScanOutcome),
}

impl Admission {
    pub fn plan_id(&self) -> Option<i64> {
        match self {
            Admission::Plan { plan_id, .. } => Some(*plan_id),
            _ => None,
        }
    }

    pub fn target_rate(&self) -> i64 {
        match self {
            Admission::Plan { target_rate, .. } => *target_rate,
            _ => 0,
        }
    }
}

/// Select the plan a unit of `part_no` counts toward
///
/// Candidates are open plans for the part still short of target, preferring
/// PLANNED over PAUSED over ACTIVE, then ascending sequence. A candidate that
/// is not ACTIVE yet is only promoted when no lower-sequence plan is still
/// open on the line: a lower open plan for the same part is taken instead, one
/// for another part blocks with `ModelMismatch`.
pub fn select_plan(plans: &[PlanItem], part_no: &str, require_plan: bool) -> Admission {
    let for_part: Vec<&PlanItem> = plans.iter().filter(|p| p.part_no == part_no).collect();
    if for_part.is_empty() {
        return if require_plan {
            Admission::Rejected(ScanOutcome::OutOfPlan)
        } else {
            Admission::Unplanned
        };
    }

    let mut candidates: Vec<&PlanItem> = for_part.iter().copied().filter(|p| p.is_eligible()).collect();
    if candidates.is_empty() {
        return if for_part.iter().any(|p| p.is_complete()) {
            Admission::Rejected(ScanOutcome::PlanComplete)
        } else {
            Admission::Rejected(ScanOutcome::OutOfPlan)
        };
    }

    candidates.sort_by_key(|p| (p.status.selection_rank(), p.sequence, p.id));
    let mut chosen = candidates[0];

    if chosen.status != PlanStatus::Active {
        let blocking = plans
            .iter()
            .filter(|p| p.is_eligible() && p.id != chosen.id && p.sequence < chosen.sequence)
            .min_by_key(|p| (p.sequence, p.id));

        if let Some(blocking) = blocking {
            if blocking.part_no != part_no {
                return Admission::Rejected(ScanOutcome::ModelMismatch {
                    active_part_no: blocking.part_no.clone(),
                });
            }
            chosen = blocking;
        }
    }

    Admission::Plan {
        plan_id: chosen.id,
        activate: chosen.status != PlanStatus::Active,
        target_rate: chosen.target_rate,
    }
}
