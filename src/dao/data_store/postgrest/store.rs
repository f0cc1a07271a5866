use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::dao::{
    data_store::DataStore,
    storage::{Filter, Row, StorageResult, Table},
};

use super::{
    config::PostgrestConfig,
    error::{PostgrestError, PostgrestResult},
};

const RETURN_REPRESENTATION: &str = "return=representation";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`DataStore`] speaking the PostgREST HTTP dialect.
#[derive(Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
}

impl PostgrestStore {
    /// Build the HTTP client; no request is sent until the first call.
    pub fn connect(config: PostgrestConfig) -> PostgrestResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| PostgrestError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(config.base_url.trim_end_matches('/')),
            api_key: config.api_key.map(Arc::<str>::from),
        })
    }

    fn request(&self, method: Method, path: &str, filter: &Filter) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url).query(&filter_params(filter));
        match self.api_key {
            Some(ref key) => builder
                .header("apikey", key.as_ref())
                .bearer_auth(key.as_ref()),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        path: &str,
    ) -> PostgrestResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|source| PostgrestError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ErrorBody>().await.ok();
        Err(PostgrestError::RequestStatus {
            path: path.to_string(),
            status,
            code: body.as_ref().and_then(|b| b.code.clone()),
            message: body
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string()),
        })
    }

    async fn rows(response: Response, path: &str) -> PostgrestResult<Vec<Row>> {
        response
            .json::<Vec<Row>>()
            .await
            .map_err(|source| PostgrestError::DecodeResponse {
                path: path.to_string(),
                source,
            })
    }
}

/// Translate equality conditions into PostgREST query parameters.
fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|(column, value)| {
            let operand = match value {
                Value::Null => "is.null".to_string(),
                Value::String(text) => format!("eq.{text}"),
                other => format!("eq.{other}"),
            };
            (column.clone(), operand)
        })
        .collect()
}

impl DataStore for PostgrestStore {
    fn query(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let store = self.clone();
        Box::pin(async move {
            let path = table.name();
            let builder = store.request(Method::GET, path, &filter);
            let response = store
                .send(builder, path)
                .await
                .map_err(|err| err.into_storage(path, "query"))?;
            Self::rows(response, path)
                .await
                .map_err(|err| err.into_storage(path, "query"))
        })
    }

    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<Row>> {
        let store = self.clone();
        Box::pin(async move {
            let path = table.name();
            let builder = store
                .request(Method::POST, path, &Filter::all())
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&row);
            let response = store
                .send(builder, path)
                .await
                .map_err(|err| err.into_storage(path, "insert"))?;
            let mut rows = Self::rows(response, path)
                .await
                .map_err(|err| err.into_storage(path, "insert"))?;
            if rows.is_empty() {
                Ok(row)
            } else {
                Ok(rows.swap_remove(0))
            }
        })
    }

    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Row,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let store = self.clone();
        Box::pin(async move {
            let path = table.name();
            let builder = store
                .request(Method::PATCH, path, &filter)
                .header("Prefer", RETURN_REPRESENTATION)
                .json(&patch);
            let response = store
                .send(builder, path)
                .await
                .map_err(|err| err.into_storage(path, "update"))?;
            Self::rows(response, path)
                .await
                .map_err(|err| err.into_storage(path, "update"))
        })
    }

    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = table.name();
            let builder = store.request(Method::DELETE, path, &filter);
            store
                .send(builder, path)
                .await
                .map(|_| ())
                .map_err(|err| err.into_storage(path, "delete"))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let builder = store.request(Method::GET, "", &Filter::all());
            store
                .send(builder, "/")
                .await
                .map(|_| ())
                .map_err(|err| err.into_storage("root", "health check"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_become_postgrest_operators() {
        let filter = Filter::all()
            .eq("room_id", "r1")
            .eq("is_active", true)
            .eq("current_activity_id", Value::Null);
        assert_eq!(
            filter_params(&filter),
            vec![
                ("room_id".to_string(), "eq.r1".to_string()),
                ("is_active".to_string(), "eq.true".to_string()),
                ("current_activity_id".to_string(), "is.null".to_string()),
            ]
        );
    }
}
