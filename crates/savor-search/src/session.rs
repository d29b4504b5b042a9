//! The streaming search session.
//!
//! One session runs a single query to completion and emits an ordered
//! sequence of typed events on an mpsc channel: `debug` with the parsed
//! intent, then either a `chat` failure/no-match message or a
//! `restaurants` payload followed by streamed `chat` chunks. The channel
//! closing is the end-of-stream sentinel.
//!
//! Every user-visible failure turns into a `chat` event and a clean
//! termination; the connection is never dropped abruptly from this side.
//! Client disconnects surface as a closed channel, which cancels whatever
//! stage is in flight.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use savor_common::vector::l2_normalize;
use savor_config::ModelConfig;
use savor_llm::OllamaClient;
use savor_store::{GeoPoint, RankedRestaurant, SearchFilter, Store};

use crate::parser::{ParsedQuery, QueryParser};
use crate::prompts;

const MSG_CANT_PARSE: &str = "I couldn't understand your request. Try rephrasing your search.";
const MSG_CANT_EMBED: &str = "I couldn't understand your query.";
const MSG_SEARCH_FAILED: &str = "Something went wrong while searching. Please try again.";
const MSG_NO_MATCHES: &str = "I couldn't find any restaurants matching your criteria.";
const MSG_SUMMARY_FAILED: &str = "I found results but couldn't produce a summary. Please try again.";

/// One typed event on the session's wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SessionEvent {
    /// The parsed intent, emitted first.
    Debug(ParsedQuery),
    /// The ranked result list, JSON-encoded.
    Restaurants(String),
    /// A human-readable message or a streamed answer chunk.
    Chat(String),
}

/// Runs search sessions against the store and the model server.
pub struct SearchSession {
    store: Arc<Store>,
    llm: OllamaClient,
    parser: QueryParser,
    embedding_model: String,
    context_model: String,
}

impl SearchSession {
    pub fn new(store: Arc<Store>, llm: OllamaClient, models: &ModelConfig) -> Self {
        let parser = QueryParser::new(llm.clone(), models.parser_model.clone());
        Self {
            store,
            llm,
            parser,
            embedding_model: models.embedding_model.clone(),
            context_model: models.context_model.clone(),
        }
    }

    /// Start one session. Events arrive on the returned channel; the
    /// channel closing is the end-of-stream sentinel. Dropping the
    /// receiver cancels the in-flight stage.
    pub fn search(
        self: &Arc<Self>,
        input: String,
        location: Option<GeoPoint>,
    ) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {}
                _ = session.run(&tx, &input, location) => {}
            }
        });
        rx
    }

    async fn run(&self, tx: &mpsc::Sender<SessionEvent>, input: &str, location: Option<GeoPoint>) {
        let parsed = match self.parser.parse(input).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "failed to parse user input");
                send_chat(tx, MSG_CANT_PARSE).await;
                return;
            }
        };
        if tx.send(SessionEvent::Debug(parsed.clone())).await.is_err() {
            return;
        }

        let filter = filter_from(&parsed, location);

        // Embed the original utterance, not the cleaned query: the words
        // the parser strips still shift the query in vector space.
        let mut vector = match self.llm.embed(&self.embedding_model, input).await {
            Ok(vector) => vector,
            Err(e) => {
                error!(error = %e, "query embedding failed");
                send_chat(tx, MSG_SEARCH_FAILED).await;
                return;
            }
        };
        if !l2_normalize(&mut vector) {
            send_chat(tx, MSG_CANT_EMBED).await;
            return;
        }

        let results = match self.store.search(vector, &filter).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "retrieval failed");
                send_chat(tx, MSG_SEARCH_FAILED).await;
                return;
            }
        };
        if results.is_empty() {
            send_chat(tx, MSG_NO_MATCHES).await;
            return;
        }

        let payload = match serde_json::to_string(&serde_json::json!({ "results": results })) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode results");
                send_chat(tx, MSG_SEARCH_FAILED).await;
                return;
            }
        };
        if tx.send(SessionEvent::Restaurants(payload)).await.is_err() {
            return;
        }

        let brief = build_brief(input, &results);
        let mut stream = match self
            .llm
            .chat_stream(&self.context_model, prompts::CONTEXT_SYSTEM, &brief)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to start answer generation");
                send_chat(tx, MSG_SUMMARY_FAILED).await;
                return;
            }
        };

        loop {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(SessionEvent::Chat(chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "answer generation interrupted");
                    send_chat(tx, MSG_SUMMARY_FAILED).await;
                    return;
                }
            }
        }
    }
}

async fn send_chat(tx: &mpsc::Sender<SessionEvent>, message: &str) {
    let _ = tx.send(SessionEvent::Chat(message.to_string())).await;
}

/// Build the retrieval filter: defaults, overridden by parsed intent.
pub(crate) fn filter_from(parsed: &ParsedQuery, location: Option<GeoPoint>) -> SearchFilter {
    let mut filter = SearchFilter {
        location,
        ..SearchFilter::default()
    };
    if let Some(distance) = parsed.distance {
        filter.max_distance = distance;
    }
    if let Some(rating) = parsed.rating {
        filter.min_rating = rating;
    }
    filter
}

/// The compact textual brief handed to the context model.
pub(crate) fn build_brief(input: &str, results: &[RankedRestaurant]) -> String {
    let mut brief = String::new();
    brief.push_str("The user asked for restaurants with this prompt: ");
    brief.push_str(input);
    brief.push_str("\nHere are the restaurants that matched:\n");

    for ranked in results {
        brief.push_str(&ranked.restaurant.fingerprint());
        brief.push('\n');
        for item in &ranked.menu_items {
            brief.push_str("\t\t");
            brief.push_str(&item.fingerprint());
            brief.push('\n');
        }
        brief.push_str("--------------------\n");
    }

    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use savor_store::{MenuItem, Restaurant};

    fn parsed(distance: Option<f64>, rating: Option<f64>) -> ParsedQuery {
        ParsedQuery {
            query: "spicy ramen".into(),
            distance,
            rating,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_filter_defaults() {
        let filter = filter_from(&parsed(None, None), None);
        assert_eq!(filter.max_distance, 20_000.0);
        assert_eq!(filter.min_rating, 3.0);
        assert!(filter.location.is_none());
    }

    #[test]
    fn test_filter_overrides() {
        let origin = GeoPoint { lat: 25.2, long: 55.3 };
        let filter = filter_from(&parsed(Some(10_000.0), Some(4.0)), Some(origin));
        assert_eq!(filter.max_distance, 10_000.0);
        assert_eq!(filter.min_rating, 4.0);
        assert_eq!(filter.location, Some(origin));
    }

    #[test]
    fn test_event_wire_shapes() {
        let debug = SessionEvent::Debug(parsed(Some(10_000.0), None));
        let json = serde_json::to_string(&debug).unwrap();
        assert!(json.starts_with(r#"{"type":"debug","data":{"#));
        assert!(json.contains(r#""query":"spicy ramen""#));
        assert!(json.contains(r#""distance":10000.0"#));

        let chat = SessionEvent::Chat("hello".into());
        assert_eq!(
            serde_json::to_string(&chat).unwrap(),
            r#"{"type":"chat","data":"hello"}"#
        );

        let restaurants = SessionEvent::Restaurants(r#"{"results":[]}"#.into());
        assert_eq!(
            serde_json::to_string(&restaurants).unwrap(),
            r#"{"type":"restaurants","data":"{\"results\":[]}"}"#
        );
    }

    #[test]
    fn test_build_brief_lists_restaurants_and_prices() {
        let results = vec![RankedRestaurant {
            restaurant: Restaurant {
                id: 1,
                name: "Ramen Palace".into(),
                area: "Downtown".into(),
                rating: 4.5,
                badges: vec![],
                location: None,
            },
            menu_items: vec![MenuItem {
                id: 9,
                restaurant_id: 1,
                category: "Mains".into(),
                name: "Tonkotsu".into(),
                price: 42.0,
                description: "Pork bone broth ramen".into(),
            }],
        }];

        let brief = build_brief("spicy ramen near me", &results);
        assert!(brief.contains("spicy ramen near me"));
        assert!(brief.contains("Restaurant: Ramen Palace, Area: Downtown"));
        assert!(brief.contains("Price: 42.00"));
    }
}
