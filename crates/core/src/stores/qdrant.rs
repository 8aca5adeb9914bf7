use crate::error::{Result, SweepError};
use crate::traits::{rank_order, MetadataFilter, ScoredPoint, VectorRecord, VectorStore};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

const BACKEND: &str = "qdrant";
const ID_FIELD: &str = "record_id";

/// Qdrant over its REST API. Collections use cosine distance and are
/// created by the first upsert.
pub struct QdrantStore {
    endpoint: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.endpoint, collection)
    }

    async fn ensure_collection(&self, collection: &str, vector_size: usize) -> Result<()> {
        let response = self.client.get(self.collection_url(collection)).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(self.collection_url(collection))
            .json(&json!({
                "vectors": { "size": vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;

        // A concurrent creator may win the race; Qdrant answers 409 then.
        if !response.status().is_success() && response.status() != StatusCode::CONFLICT {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }
}

/// Qdrant only accepts integer or UUID point ids.
pub fn point_id(record_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes())
}

fn backend_error(status: StatusCode) -> SweepError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SweepError::Transient {
            backend: BACKEND.to_string(),
            details: status.to_string(),
        }
    } else {
        SweepError::BackendResponse {
            backend: BACKEND.to_string(),
            details: status.to_string(),
        }
    }
}

fn point_body(record: &VectorRecord) -> Value {
    let mut payload = serde_json::Map::new();
    for (key, value) in &record.metadata {
        payload.insert(key.clone(), Value::String(value.clone()));
    }
    payload.insert(ID_FIELD.to_string(), Value::String(record.id.clone()));

    json!({
        "id": point_id(&record.id).to_string(),
        "vector": record.vector,
        "payload": payload,
    })
}

fn filter_body(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

fn parse_hits(body: &Value) -> Vec<ScoredPoint> {
    body.pointer("/result")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let id = hit
                        .pointer(&format!("/payload/{ID_FIELD}"))
                        .and_then(Value::as_str)?;
                    let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
                    Some(ScoredPoint {
                        id: id.to_string(),
                        score,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.ensure_collection(collection, first.vector.len()).await?;

        let points: Vec<Value> = records.iter().map(point_body).collect();
        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url(collection)))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>> {
        if top_k == 0 {
            return Err(SweepError::InvalidArgument("top_k must be at least 1".to_string()));
        }

        let mut body = json!({
            "vector": query,
            "limit": top_k,
            "with_payload": true,
        });
        if !filter.is_empty() {
            body["filter"] = filter_body(filter);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url(collection)))
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SweepError::CollectionNotFound(collection.to_string()));
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        let mut hits = parse_hits(&parsed);
        hits.sort_by(rank_order);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let response = self.client.delete(self.collection_url(collection)).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_uuids() {
        assert_eq!(point_id("chunk-1"), point_id("chunk-1"));
        assert_ne!(point_id("chunk-1"), point_id("chunk-2"));
    }

    #[test]
    fn payload_keeps_the_original_id() {
        let record = VectorRecord {
            id: "abc".to_string(),
            vector: vec![0.1, 0.2],
            metadata: [("strategy".to_string(), "fixed_token".to_string())]
                .into_iter()
                .collect(),
        };
        let body = point_body(&record);
        assert_eq!(body.pointer("/payload/record_id"), Some(&json!("abc")));
        assert_eq!(body.pointer("/payload/strategy"), Some(&json!("fixed_token")));
        assert_eq!(body.pointer("/id"), Some(&json!(point_id("abc").to_string())));
    }

    #[test]
    fn filters_become_must_conditions() {
        let filter: MetadataFilter = [("document_id".to_string(), "d1".to_string())]
            .into_iter()
            .collect();
        assert_eq!(
            filter_body(&filter),
            json!({ "must": [{ "key": "document_id", "match": { "value": "d1" } }] })
        );
    }

    #[test]
    fn hits_without_an_original_id_are_skipped() {
        let body = json!({
            "result": [
                { "id": "x", "score": 0.4, "payload": { "record_id": "b" } },
                { "id": "y", "score": 0.9, "payload": {} },
                { "id": "z", "score": 0.4, "payload": { "record_id": "a" } }
            ]
        });
        let mut hits = parse_hits(&body);
        hits.sort_by(rank_order);
        let ids: Vec<_> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
