//! Natural-language intent parsing.
//!
//! The parser model is constrained to emit strict JSON: a cleaned query,
//! optional distance and rating parameters, and a confidence score. The
//! output is validated on ingress; model output is never trusted with
//! unbounded values.

use serde::{Deserialize, Serialize};
use tracing::debug;

use savor_common::{Error, Result};
use savor_llm::OllamaClient;

use crate::prompts;

/// Structured search intent extracted from a user utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    /// Search text with parameter-bearing words removed.
    pub query: String,
    /// Maximum distance in meters, when the utterance constrained it.
    #[serde(default)]
    pub distance: Option<f64>,
    /// Minimum rating on the 1-5 scale, when the utterance constrained it.
    #[serde(default)]
    pub rating: Option<f64>,
    /// Parser confidence in [0, 1]. Mandatory in the model's schema, like
    /// `query`: a response that omits it is rejected outright.
    pub confidence: f64,
}

impl ParsedQuery {
    /// Reject out-of-bounds parameters.
    pub fn validate(&self) -> Result<()> {
        if let Some(distance) = self.distance {
            if distance <= 0.0 {
                return Err(Error::InvalidInput("distance must be positive".into()));
            }
        }
        if let Some(rating) = self.rating {
            if !(1.0..=5.0).contains(&rating) {
                return Err(Error::InvalidInput(
                    "rating must be between 1 and 5".into(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidInput(
                "confidence must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// Runs the parser model over raw user input.
pub struct QueryParser {
    llm: OllamaClient,
    model: String,
}

impl QueryParser {
    pub fn new(llm: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Parse one utterance into validated intent.
    pub async fn parse(&self, input: &str) -> Result<ParsedQuery> {
        let prompt = format!("Parse this search query and return only valid JSON: {input:?}");
        let raw = self
            .llm
            .generate_json(&self.model, prompts::PARSER_SYSTEM, &prompt)
            .await?;

        let parsed: ParsedQuery = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidInput(format!("unparseable intent: {e}")))?;
        parsed.validate()?;
        debug!(?parsed, "parsed search intent");
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(distance: Option<f64>, rating: Option<f64>, confidence: f64) -> ParsedQuery {
        ParsedQuery {
            query: "spicy ramen".into(),
            distance,
            rating,
            confidence,
        }
    }

    #[test]
    fn test_validate_accepts_bounds() {
        parsed(Some(10_000.0), Some(4.0), 0.9).validate().unwrap();
        parsed(None, None, 0.0).validate().unwrap();
        parsed(None, Some(1.0), 1.0).validate().unwrap();
        parsed(None, Some(5.0), 1.0).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_nonpositive_distance() {
        assert!(parsed(Some(0.0), None, 0.5).validate().is_err());
        assert!(parsed(Some(-100.0), None, 0.5).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_rating_out_of_range() {
        assert!(parsed(None, Some(0.5), 0.5).validate().is_err());
        assert!(parsed(None, Some(5.1), 0.5).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_confidence_out_of_range() {
        assert!(parsed(None, None, -0.1).validate().is_err());
        assert!(parsed(None, None, 1.5).validate().is_err());
    }

    #[test]
    fn test_deserialize_with_nulls() {
        let parsed: ParsedQuery = serde_json::from_str(
            r#"{"query":"spicy ramen","distance":10000,"rating":null,"confidence":0.92}"#,
        )
        .unwrap();
        assert_eq!(parsed.query, "spicy ramen");
        assert_eq!(parsed.distance, Some(10_000.0));
        assert_eq!(parsed.rating, None);
    }

    #[test]
    fn test_deserialize_missing_optionals() {
        let parsed: ParsedQuery =
            serde_json::from_str(r#"{"query":"sushi omakase","confidence":0.8}"#).unwrap();
        assert_eq!(parsed.distance, None);
        assert_eq!(parsed.rating, None);
    }

    #[test]
    fn test_deserialize_missing_confidence_rejected() {
        let result: std::result::Result<ParsedQuery, _> =
            serde_json::from_str(r#"{"query":"sushi omakase"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_parse_against_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "role": "assistant",
                    "content": "{\"query\":\"spicy ramen\",\"distance\":10000,\"rating\":null,\"confidence\":0.9}"
                },
                "done": true
            })))
            .mount(&server)
            .await;

        let parser = QueryParser::new(OllamaClient::new(server.uri()).unwrap(), "llama3.1");
        let parsed = parser.parse("spicy ramen near me").await.unwrap();
        assert_eq!(parsed.query, "spicy ramen");
        assert_eq!(parsed.distance, Some(10_000.0));
    }

    #[tokio::test]
    async fn test_parse_rejects_invalid_model_output() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "role": "assistant",
                    "content": "{\"query\":\"ramen\",\"distance\":-5,\"confidence\":0.9}"
                },
                "done": true
            })))
            .mount(&server)
            .await;

        let parser = QueryParser::new(OllamaClient::new(server.uri()).unwrap(), "llama3.1");
        assert!(parser.parse("ramen").await.is_err());
    }
}
