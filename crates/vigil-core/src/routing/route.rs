//! Compiled notification routing tree

use std::collections::BTreeSet;
use std::time::Duration;

use crate::configstore::Route;
use crate::error::{Error, Result};
use crate::models::Labels;

use super::matcher::{MatchType, Matcher, Matchers};

/// Default time to wait before the first notification of a new group
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default minimum time between notifications for a changed group
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default time before an unchanged firing group is notified again
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Label name meaning "group by every label"
const GROUP_BY_ALL: &str = "...";

/// How alerts of a route are split into aggregation groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// One group per distinct label set
    All,
    /// One group per distinct value combination of these labels
    Labels(Vec<String>),
}

impl GroupBy {
    /// Labels of `alert` that identify its aggregation group
    pub fn group_labels(&self, alert: &Labels) -> Labels {
        match self {
            Self::All => alert.clone(),
            Self::Labels(names) => names
                .iter()
                .filter_map(|n| alert.get(n).map(|v| (n.as_str(), v)))
                .collect(),
        }
    }
}

/// A route with every inherited option resolved
#[derive(Debug, Clone)]
pub struct RouteNode {
    /// Position in the tree, e.g. `0/2/1`
    pub id: String,
    /// Receiver of alerts that stop at this node
    pub receiver: String,
    /// How alerts of this node are grouped
    pub group_by: GroupBy,
    /// Delay before a new group first flushes
    pub group_wait: Duration,
    /// Delay between flushes of a changed group
    pub group_interval: Duration,
    /// Delay before an unchanged firing group is sent again
    pub repeat_interval: Duration,
    /// Keep matching siblings after this node matched
    pub continue_matching: bool,
    /// Matchers an alert must satisfy to enter this node
    pub matchers: Matchers,
    /// Child nodes, tried in order
    pub routes: Vec<RouteNode>,
}

impl RouteNode {
    fn build(route: &Route, parent: Option<&RouteNode>, id: String) -> Result<Self> {
        let receiver = match (&route.receiver, parent) {
            (Some(r), _) if !r.is_empty() => r.clone(),
            (_, Some(p)) => p.receiver.clone(),
            _ => {
                return Err(Error::config_validation(
                    "root route must specify a default receiver",
                ))
            }
        };

        let group_by = match &route.group_by {
            Some(names) if names.iter().any(|n| n == GROUP_BY_ALL) => {
                if names.len() > 1 {
                    return Err(Error::config_validation(
                        "cannot have wildcard group_by (`...`) and other labels at the same time",
                    ));
                }
                GroupBy::All
            }
            Some(names) => GroupBy::Labels(names.clone()),
            None => parent.map_or(GroupBy::Labels(Vec::new()), |p| p.group_by.clone()),
        };

        let inherit = |value: &Option<String>, field: &str, from_parent: Option<Duration>, default: Duration| {
            match value {
                Some(raw) => parse_duration(raw, field),
                None => Ok(from_parent.unwrap_or(default)),
            }
        };
        let group_wait = inherit(&route.group_wait, "group_wait", parent.map(|p| p.group_wait), DEFAULT_GROUP_WAIT)?;
        let group_interval = inherit(
            &route.group_interval,
            "group_interval",
            parent.map(|p| p.group_interval),
            DEFAULT_GROUP_INTERVAL,
        )?;
        let repeat_interval = inherit(
            &route.repeat_interval,
            "repeat_interval",
            parent.map(|p| p.repeat_interval),
            DEFAULT_REPEAT_INTERVAL,
        )?;
        if group_interval.is_zero() {
            return Err(Error::config_validation("group_interval cannot be zero"));
        }
        if repeat_interval.is_zero() {
            return Err(Error::config_validation("repeat_interval cannot be zero"));
        }

        let matchers = compile_matchers(route)?;
        if parent.is_none() && !matchers.is_empty() {
            return Err(Error::config_validation("root route must not have any matchers"));
        }
        if parent.is_none() && route.continue_matching {
            return Err(Error::config_validation("cannot have continue in root route"));
        }

        let mut node = RouteNode {
            id,
            receiver,
            group_by,
            group_wait,
            group_interval,
            repeat_interval,
            continue_matching: route.continue_matching,
            matchers,
            routes: Vec::with_capacity(route.routes.len()),
        };

        for (i, child) in route.routes.iter().enumerate() {
            let child_id = format!("{}/{}", node.id, i);
            let built = RouteNode::build(child, Some(&node), child_id)?;
            node.routes.push(built);
        }

        Ok(node)
    }

    fn collect<'a>(&'a self, labels: &Labels, out: &mut Vec<&'a RouteNode>) -> bool {
        if !self.matchers.matches(labels) {
            return false;
        }

        let mut matched = Vec::new();
        for child in &self.routes {
            if child.collect(labels, &mut matched) && !child.continue_matching {
                break;
            }
        }

        if matched.is_empty() {
            out.push(self);
        } else {
            out.extend(matched);
        }
        true
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a RouteNode)) {
        visit(self);
        for child in &self.routes {
            child.walk(visit);
        }
    }
}

fn compile_matchers(route: &Route) -> Result<Matchers> {
    let mut matchers = Vec::new();

    for (name, value) in &route.match_eq {
        matchers.push(Matcher::new(name, MatchType::Equal, value)?);
    }
    for (name, value) in &route.match_re {
        matchers.push(Matcher::new(name, MatchType::Regexp, value)?);
    }
    for raw in &route.matchers {
        matchers.push(Matcher::parse(raw)?);
    }
    for [name, op, value] in &route.object_matchers {
        matchers.push(Matcher::new(name, op.parse()?, value)?);
    }

    Ok(Matchers(matchers))
}

fn parse_duration(raw: &str, field: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::config_validation(format!("invalid {field} {raw:?}: {e}")))
}

/// The compiled routing tree
#[derive(Debug, Clone)]
pub struct RouteTree {
    root: RouteNode,
}

impl RouteTree {
    /// Compile a route, checking that every referenced receiver exists
    pub fn build<'a>(route: &Route, receivers: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let root = RouteNode::build(route, None, "0".to_string())?;
        let tree = Self { root };

        let known: BTreeSet<&str> = receivers.into_iter().collect();
        for name in tree.referenced_receivers() {
            if !known.contains(name.as_str()) {
                return Err(Error::config_validation(format!(
                    "undefined receiver {name:?} used in route"
                )));
            }
        }

        Ok(tree)
    }

    /// The root node
    pub fn root(&self) -> &RouteNode {
        &self.root
    }

    /// Routes an alert with these labels is delivered through
    pub fn match_labels(&self, labels: &Labels) -> Vec<&RouteNode> {
        let mut out = Vec::new();
        self.root.collect(labels, &mut out);
        out
    }

    /// Every receiver named anywhere in the tree
    pub fn referenced_receivers(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.root.walk(&mut |node| {
            names.insert(node.receiver.clone());
        });
        names
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&RouteNode> {
        let mut found = None;
        self.root.walk(&mut |node| {
            if found.is_none() && node.id == id {
                found = Some(node);
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(json: serde_json::Value) -> Route {
        serde_json::from_value(json).unwrap()
    }

    fn receivers(tree: &[&RouteNode]) -> Vec<String> {
        tree.iter().map(|n| n.receiver.clone()).collect()
    }

    fn tree() -> RouteTree {
        let r = route(serde_json::json!({
            "receiver": "default",
            "group_by": ["alertname"],
            "group_wait": "10s",
            "routes": [
                {"receiver": "team-a", "match": {"team": "a"}, "continue": true,
                 "routes": [{"receiver": "team-a-critical", "matchers": ["severity=\"critical\""]}]},
                {"receiver": "ops", "object_matchers": [["team", "=~", "a|b"]], "repeat_interval": "1h"},
                {"receiver": "never", "match": {"team": "b"}}
            ]
        }));
        RouteTree::build(&r, ["default", "team-a", "team-a-critical", "ops", "never"]).unwrap()
    }

    #[test]
    fn test_unmatched_alert_uses_root() {
        let tree = tree();
        let matched = tree.match_labels(&Labels::from([("team", "z")]));
        assert_eq!(receivers(&matched), vec!["default"]);
    }

    #[test]
    fn test_continue_visits_following_siblings() {
        let tree = tree();
        let matched = tree.match_labels(&Labels::from([("team", "a")]));
        assert_eq!(receivers(&matched), vec!["team-a", "ops"]);
    }

    #[test]
    fn test_deepest_match_wins() {
        let tree = tree();
        let matched = tree.match_labels(&Labels::from([("team", "a"), ("severity", "critical")]));
        assert_eq!(receivers(&matched), vec!["team-a-critical", "ops"]);
    }

    #[test]
    fn test_first_match_stops_without_continue() {
        let tree = tree();
        let matched = tree.match_labels(&Labels::from([("team", "b")]));
        assert_eq!(receivers(&matched), vec!["ops"]);
    }

    #[test]
    fn test_options_are_inherited() {
        let tree = tree();
        let critical = tree.node("0/0/0").unwrap();
        assert_eq!(critical.group_wait, Duration::from_secs(10));
        assert_eq!(critical.group_interval, DEFAULT_GROUP_INTERVAL);
        assert_eq!(critical.group_by, GroupBy::Labels(vec!["alertname".to_string()]));

        let ops = tree.node("0/1").unwrap();
        assert_eq!(ops.repeat_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_child_without_receiver_inherits_parent() {
        let r = route(serde_json::json!({
            "receiver": "default",
            "routes": [{"match": {"team": "a"}}]
        }));
        let tree = RouteTree::build(&r, ["default"]).unwrap();
        assert_eq!(tree.node("0/0").unwrap().receiver, "default");
    }

    #[test]
    fn test_root_validation() {
        let no_receiver = route(serde_json::json!({}));
        assert!(matches!(
            RouteTree::build(&no_receiver, ["default"]),
            Err(Error::ConfigValidation(_))
        ));

        let with_matchers = route(serde_json::json!({"receiver": "default", "match": {"a": "b"}}));
        assert!(matches!(
            RouteTree::build(&with_matchers, ["default"]),
            Err(Error::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_undefined_receiver_is_rejected() {
        let r = route(serde_json::json!({
            "receiver": "default",
            "routes": [{"receiver": "missing", "match": {"a": "b"}}]
        }));
        let err = RouteTree::build(&r, ["default"]).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_group_by_all() {
        let r = route(serde_json::json!({"receiver": "default", "group_by": ["..."]}));
        let tree = RouteTree::build(&r, ["default"]).unwrap();
        assert_eq!(tree.root().group_by, GroupBy::All);

        let mixed = route(serde_json::json!({"receiver": "default", "group_by": ["...", "team"]}));
        assert!(RouteTree::build(&mixed, ["default"]).is_err());
    }

    #[test]
    fn test_referenced_receivers() {
        let names = tree().referenced_receivers();
        assert!(names.contains("team-a-critical"));
        assert_eq!(names.len(), 5);
    }
}
