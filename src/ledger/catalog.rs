use serde::{Deserialize, Serialize};

/// key: plan-catalog -> refill sizes,rollover caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    ProYearly,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::ProYearly => "pro_yearly",
        }
    }

    /// Closed enum by contract; anything unrecognized collapses to `free`
    /// rather than failing a read path.
    pub fn from_str_lenient(raw: &str) -> Plan {
        match raw {
            "starter" => Plan::Starter,
            "pro" => Plan::Pro,
            "pro_yearly" => Plan::ProYearly,
            _ => Plan::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanConfig {
    pub monthly_credits: i64,
    pub max_subscription_credits: i64,
}

/// Total over the four plan values. `free` never refills.
pub fn plan_config(plan: Plan) -> PlanConfig {
    match plan {
        Plan::Free => PlanConfig {
            monthly_credits: 0,
            max_subscription_credits: 0,
        },
        Plan::Starter => PlanConfig {
            monthly_credits: 100,
            max_subscription_credits: 200,
        },
        Plan::Pro | Plan::ProYearly => PlanConfig {
            monthly_credits: 300,
            max_subscription_credits: 600,
        },
    }
}

/// Collapse a set of simultaneously-active entitlement ids to a single
/// plan. Precedence is fixed: pro_yearly > pro > starter > free.
pub fn resolve_plan<'a, I>(active_entitlements: I) -> Plan
where
    I: IntoIterator<Item = &'a str>,
{
    let mut resolved = Plan::Free;
    for id in active_entitlements {
        let candidate = match id {
            "pro_yearly" => Plan::ProYearly,
            "pro" => Plan::Pro,
            "starter" => Plan::Starter,
            _ => continue,
        };
        if rank(candidate) > rank(resolved) {
            resolved = candidate;
        }
    }
    resolved
}

fn rank(plan: Plan) -> u8 {
    match plan {
        Plan::Free => 0,
        Plan::Starter => 1,
        Plan::Pro => 2,
        Plan::ProYearly => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plan_has_no_allotment() {
        let config = plan_config(Plan::Free);
        assert_eq!(config.monthly_credits, 0);
        assert_eq!(config.max_subscription_credits, 0);
    }

    #[test]
    fn every_plan_caps_at_or_above_monthly_grant() {
        for plan in [Plan::Free, Plan::Starter, Plan::Pro, Plan::ProYearly] {
            let config = plan_config(plan);
            assert!(config.max_subscription_credits >= config.monthly_credits);
        }
    }

    #[test]
    fn unknown_plan_string_falls_back_to_free() {
        assert_eq!(Plan::from_str_lenient("platinum"), Plan::Free);
        assert_eq!(Plan::from_str_lenient(""), Plan::Free);
        assert_eq!(Plan::from_str_lenient("pro_yearly"), Plan::ProYearly);
    }

    #[test]
    fn precedence_picks_highest_of_simultaneous_entitlements() {
        assert_eq!(resolve_plan(["starter", "pro"]), Plan::Pro);
        assert_eq!(
            resolve_plan(["pro", "pro_yearly", "starter"]),
            Plan::ProYearly
        );
        assert_eq!(resolve_plan(["starter"]), Plan::Starter);
    }

    #[test]
    fn no_recognized_entitlement_resolves_to_free() {
        assert_eq!(resolve_plan([]), Plan::Free);
        assert_eq!(resolve_plan(["lifetime_gold"]), Plan::Free);
    }

    #[test]
    fn serde_round_trips_snake_case() {
        let value = serde_json::to_string(&Plan::ProYearly).unwrap();
        assert_eq!(value, "\"pro_yearly\"");
        let back: Plan = serde_json::from_str(&value).unwrap();
        assert_eq!(back, Plan::ProYearly);
    }
}
