//! Routing decisions and their wire form.
//!
//! The contract is identical whether the route manager runs in-process
//! (subscribed to the routing topic) or remotely behind a persistent
//! connection: the same envelope against the same store snapshot yields
//! the same decision.

use gati_core::envelope::{Headers, RequestEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The route manager's answer for one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Answered directly, without dispatching a handler (404, 405, policy
    /// denials, and the rare inline response).
    Handled {
        status: u16,
        body: Option<serde_json::Value>,
        headers: Headers,
    },
    /// The normal case: dispatch to a resolved handler version.
    Forward {
        handler_id: String,
        version_id: String,
        /// Extracted path parameters.
        params: BTreeMap<String, String>,
        /// The matched pattern, for metrics.
        pattern: String,
        /// Transformer refs to bridge the requested version, when the
        /// direct version is not the serving one.
        transformer_chain: Vec<String>,
        /// Module ids the handler requires (all verified healthy).
        module_endpoints: Vec<String>,
    },
    /// Ingress maps this to 503.
    Unavailable { reason: String },
}

/// Wire request: just the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub envelope: RequestEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteResponseKind {
    Handled,
    Forward,
    Unavailable,
}

/// Wire response, flattened so every kind shares one frame shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub kind: RouteResponseKind,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: Option<Headers>,
    #[serde(default)]
    pub handler_id: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub params: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub transformer_chain: Option<Vec<String>>,
    #[serde(default)]
    pub upstream: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl From<RoutingDecision> for RouteResponse {
    fn from(decision: RoutingDecision) -> Self {
        match decision {
            RoutingDecision::Handled { status, body, headers } => RouteResponse {
                kind: RouteResponseKind::Handled,
                status: Some(status),
                body,
                headers: Some(headers),
                handler_id: None,
                version_id: None,
                params: None,
                pattern: None,
                transformer_chain: None,
                upstream: None,
                reason: None,
            },
            RoutingDecision::Forward {
                handler_id,
                version_id,
                params,
                pattern,
                transformer_chain,
                module_endpoints,
            } => RouteResponse {
                kind: RouteResponseKind::Forward,
                status: None,
                body: None,
                headers: None,
                handler_id: Some(handler_id),
                version_id: Some(version_id),
                params: Some(params),
                pattern: Some(pattern),
                transformer_chain: Some(transformer_chain),
                upstream: Some(module_endpoints),
                reason: None,
            },
            RoutingDecision::Unavailable { reason } => RouteResponse {
                kind: RouteResponseKind::Unavailable,
                status: None,
                body: None,
                headers: None,
                handler_id: None,
                version_id: None,
                params: None,
                pattern: None,
                transformer_chain: None,
                upstream: None,
                reason: Some(reason),
            },
        }
    }
}

impl TryFrom<RouteResponse> for RoutingDecision {
    type Error = String;

    fn try_from(response: RouteResponse) -> Result<Self, Self::Error> {
        match response.kind {
            RouteResponseKind::Handled => Ok(RoutingDecision::Handled {
                status: response.status.ok_or("handled response lacks status")?,
                body: response.body,
                headers: response.headers.unwrap_or_default(),
            }),
            RouteResponseKind::Forward => Ok(RoutingDecision::Forward {
                handler_id: response.handler_id.ok_or("forward response lacks handler_id")?,
                version_id: response.version_id.ok_or("forward response lacks version_id")?,
                params: response.params.unwrap_or_default(),
                pattern: response.pattern.unwrap_or_default(),
                transformer_chain: response.transformer_chain.unwrap_or_default(),
                module_endpoints: response.upstream.unwrap_or_default(),
            }),
            RouteResponseKind::Unavailable => Ok(RoutingDecision::Unavailable {
                reason: response.reason.unwrap_or_else(|| "unavailable".to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_round_trips_through_wire_form() {
        let decision = RoutingDecision::Forward {
            handler_id: "h".to_string(),
            version_id: "v2".to_string(),
            params: BTreeMap::from([("id".to_string(), "42".to_string())]),
            pattern: "/users/:id".to_string(),
            transformer_chain: vec!["v2->v1".to_string()],
            module_endpoints: vec!["users".to_string()],
        };
        let wire: RouteResponse = decision.clone().into();
        let json = serde_json::to_string(&wire).unwrap();
        let back: RouteResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(RoutingDecision::try_from(back).unwrap(), decision);
    }

    #[test]
    fn handled_and_unavailable_round_trip() {
        let handled = RoutingDecision::Handled {
            status: 405,
            body: None,
            headers: {
                let mut h = Headers::new();
                h.insert("Allow", "POST");
                h
            },
        };
        let wire: RouteResponse = handled.clone().into();
        assert_eq!(RoutingDecision::try_from(wire).unwrap(), handled);

        let unavailable = RoutingDecision::Unavailable {
            reason: "version_unresolved".to_string(),
        };
        let wire: RouteResponse = unavailable.clone().into();
        assert_eq!(RoutingDecision::try_from(wire).unwrap(), unavailable);
    }

    #[test]
    fn malformed_wire_response_is_rejected() {
        let response = RouteResponse {
            kind: RouteResponseKind::Forward,
            status: None,
            body: None,
            headers: None,
            handler_id: None,
            version_id: None,
            params: None,
            pattern: None,
            transformer_chain: None,
            upstream: None,
            reason: None,
        };
        assert!(RoutingDecision::try_from(response).is_err());
    }
}
