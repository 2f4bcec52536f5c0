//! Notification routing: matchers, the routing tree and aggregation groups

mod dispatch;
mod matcher;
mod route;

pub use dispatch::Dispatcher;
pub use matcher::{MatchType, Matcher, Matchers};
pub use route::{
    GroupBy, RouteNode, RouteTree, DEFAULT_GROUP_INTERVAL, DEFAULT_GROUP_WAIT, DEFAULT_REPEAT_INTERVAL,
};
