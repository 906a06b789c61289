//! Blocking conditions and custom throttle policies pushed with throttle data.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use super::counter::CounterLimit;

/// What a blocking condition matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingConditionType {
    /// API context
    Api,
    /// `subscriber:application-name`
    Application,
    User,
    /// `context:version:subscriber-application:KEY_TYPE`
    Subscription,
    Ip,
    IpRange,
}

impl FromStr for BlockingConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "API" => Ok(Self::Api),
            "APPLICATION" => Ok(Self::Application),
            "USER" => Ok(Self::User),
            "SUBSCRIPTION" => Ok(Self::Subscription),
            "IP" => Ok(Self::Ip),
            "IPRANGE" | "IP_RANGE" => Ok(Self::IpRange),
            other => Err(format!("unknown blocking condition type: {other}")),
        }
    }
}

/// An address or inclusive address range, optionally inverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpCondition {
    pub start: IpAddr,
    pub end: IpAddr,
    /// Block everything outside the range instead of inside it
    pub invert: bool,
}

impl IpCondition {
    pub fn fixed(ip: IpAddr, invert: bool) -> Self {
        Self {
            start: ip,
            end: ip,
            invert,
        }
    }

    pub fn blocks(&self, ip: IpAddr) -> bool {
        let value = ip_to_u128(ip);
        let inside = ip_to_u128(self.start) <= value && value <= ip_to_u128(self.end);
        inside != self.invert
    }
}

/// IPv4 addresses compare in their IPv6-mapped form so mixed ranges order correctly.
fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Request attributes blocking conditions are matched against.
#[derive(Debug, Clone, Default)]
pub struct BlockingSubject {
    pub tenant: String,
    pub api_context: String,
    pub application: Option<String>,
    pub user: String,
    pub subscription: Option<String>,
    pub client_ip: Option<IpAddr>,
}

/// Active blocking conditions.
#[derive(Debug, Clone, Default)]
pub struct BlockingConditions {
    values: HashSet<(BlockingConditionType, String)>,
    ip: HashMap<String, Vec<IpCondition>>,
}

impl BlockingConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value condition (anything but IP types).
    pub fn insert_value(&mut self, kind: BlockingConditionType, value: impl Into<String>) {
        self.values.insert((kind, value.into()));
    }

    pub fn insert_ip(&mut self, tenant: impl Into<String>, condition: IpCondition) {
        self.ip.entry(tenant.into()).or_default().push(condition);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.ip.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.ip.values().map(Vec::len).sum::<usize>()
    }

    /// Description of the first condition blocking the subject.
    pub fn matching(&self, subject: &BlockingSubject) -> Option<String> {
        let candidates = [
            (BlockingConditionType::Api, Some(subject.api_context.as_str())),
            (BlockingConditionType::Application, subject.application.as_deref()),
            (BlockingConditionType::User, Some(subject.user.as_str())),
            (BlockingConditionType::Subscription, subject.subscription.as_deref()),
        ];
        for (kind, value) in candidates {
            let Some(value) = value else { continue };
            if self.values.contains(&(kind, value.to_string())) {
                return Some(format!("{kind:?}:{value}"));
            }
        }

        let ip = subject.client_ip?;
        self.ip
            .get(&subject.tenant)
            .and_then(|conditions| conditions.iter().find(|c| c.blocks(ip)))
            .map(|_| format!("Ip:{ip}"))
    }
}

/// Operator-defined policy counted on a templated key.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPolicy {
    pub name: String,
    /// Template with `$userId`, `$apiContext`, `$apiVersion`, `$appTenant`, `$apiTenant`,
    /// `$appId` and `$clientIp` placeholders
    pub key_template: String,
    pub limit: u64,
    pub window: Duration,
    /// Empty applies to every tenant
    pub tenant_domain: String,
}

/// Values substituted into custom key templates.
#[derive(Debug, Clone, Default)]
pub struct KeyVariables {
    pub user_id: String,
    pub api_context: String,
    pub api_version: String,
    pub app_tenant: String,
    pub api_tenant: String,
    pub app_id: String,
    pub client_ip: String,
}

impl CustomPolicy {
    pub fn applies_to(&self, tenant: &str) -> bool {
        self.tenant_domain.is_empty() || self.tenant_domain == tenant
    }

    pub fn limit(&self) -> CounterLimit {
        CounterLimit {
            limit: self.limit,
            window: self.window,
            stop_on_quota_reach: true,
        }
    }

    /// Counter key for a request. The policy name is prepended so two policies
    /// with the same template count separately.
    pub fn expand(&self, vars: &KeyVariables) -> String {
        let expanded = self
            .key_template
            .replace("$userId", &vars.user_id)
            .replace("$apiContext", &vars.api_context)
            .replace("$apiVersion", &vars.api_version)
            .replace("$appTenant", &vars.app_tenant)
            .replace("$apiTenant", &vars.api_tenant)
            .replace("$appId", &vars.app_id)
            .replace("$clientIp", &vars.client_ip);
        format!("{}_{expanded}", self.name)
    }
}

/// Throttle data as last delivered by the control plane.
#[derive(Debug, Clone, Default)]
pub struct ThrottleData {
    pub blocking: BlockingConditions,
    pub custom_policies: Vec<CustomPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> BlockingSubject {
        BlockingSubject {
            tenant: "carbon.super".to_string(),
            api_context: "/pets".to_string(),
            application: Some("alice:PetShop".to_string()),
            user: "alice".to_string(),
            subscription: Some("/pets:1.0:alice-PetShop:PRODUCTION".to_string()),
            client_ip: Some("10.1.2.3".parse().unwrap()),
        }
    }

    #[test]
    fn test_value_conditions_match_by_type() {
        let mut conditions = BlockingConditions::new();
        conditions.insert_value(BlockingConditionType::User, "/pets");
        assert!(conditions.matching(&subject()).is_none());

        conditions.insert_value(BlockingConditionType::Application, "alice:PetShop");
        assert_eq!(conditions.matching(&subject()).as_deref(), Some("Application:alice:PetShop"));
    }

    #[test]
    fn test_ip_range_and_invert() {
        let range = IpCondition {
            start: "10.1.0.0".parse().unwrap(),
            end: "10.1.255.255".parse().unwrap(),
            invert: false,
        };
        assert!(range.blocks("10.1.2.3".parse().unwrap()));
        assert!(!range.blocks("10.2.0.1".parse().unwrap()));

        let allow_only = IpCondition::fixed("192.168.0.1".parse().unwrap(), true);
        assert!(allow_only.blocks("10.1.2.3".parse().unwrap()));
        assert!(!allow_only.blocks("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ip_conditions_are_per_tenant() {
        let mut conditions = BlockingConditions::new();
        conditions.insert_ip("wso2.com", IpCondition::fixed("10.1.2.3".parse().unwrap(), false));
        assert!(conditions.matching(&subject()).is_none());
        conditions.insert_ip("carbon.super", IpCondition::fixed("10.1.2.3".parse().unwrap(), false));
        assert_eq!(conditions.matching(&subject()).as_deref(), Some("Ip:10.1.2.3"));
    }

    #[test]
    fn test_template_expansion() {
        let policy = CustomPolicy {
            name: "perUser".to_string(),
            key_template: "$userId:$apiContext:$apiVersion".to_string(),
            limit: 10,
            window: Duration::from_secs(60),
            tenant_domain: String::new(),
        };
        let vars = KeyVariables {
            user_id: "alice".to_string(),
            api_context: "/pets".to_string(),
            api_version: "1.0".to_string(),
            ..Default::default()
        };
        assert_eq!(policy.expand(&vars), "perUser_alice:/pets:1.0");
        assert!(policy.applies_to("any.tenant"));
    }
}
