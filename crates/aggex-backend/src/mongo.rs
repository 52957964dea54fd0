//! MongoDB backend: aggregation cursors and collection change streams.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::change_stream::event::ChangeNamespace;
use mongodb::options::ClientOptions;
use mongodb::Client;
use tracing::{debug, info};

use aggex_core::{BackendConfig, ChangeEvent, Namespace, Pipeline, ResultRecord, Scalar};

use crate::backend::{ChangeStream, ChangeSubscriber, QueryExecutor, RecordStream};
use crate::error::{BackendError, BackendResult, map_err};

/// A MongoDB deployment reached through a single pooled client.
#[derive(Clone)]
pub struct MongoBackend {
    client: Client,
}

impl MongoBackend {
    /// Connect and ping. Connect and server selection are both bounded by
    /// the configured connection timeout.
    pub async fn connect(config: &BackendConfig) -> BackendResult<Self> {
        let timeout = config.connection_timeout();
        info!(uri = %config.uri(), timeout_secs = timeout.as_secs(), "connecting to mongodb");

        let mut options = ClientOptions::parse(config.uri())
            .await
            .map_err(map_err!(Connect))?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        if let Some(max) = config.max_connections {
            options.max_pool_size = Some(max);
        }
        options.app_name.get_or_insert_with(|| "aggex".to_string());

        let client = Client::with_options(options).map_err(map_err!(Connect))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_err!(Connect))?;

        info!("mongodb reachable");
        Ok(Self { client })
    }

    fn collection(&self, namespace: &Namespace) -> mongodb::Collection<Document> {
        self.client
            .database(&namespace.database)
            .collection(&namespace.collection)
    }
}

#[async_trait]
impl QueryExecutor for MongoBackend {
    async fn run(&self, namespace: &Namespace, pipeline: &Pipeline) -> BackendResult<RecordStream> {
        let stages = to_documents(pipeline)?;
        debug!(%namespace, stages = stages.len(), "aggregate");

        let cursor = self
            .collection(namespace)
            .aggregate(stages)
            .await
            .map_err(map_err!(Query))?;

        Ok(cursor
            .map(|doc| doc.map(|d| record_from_document(&d)).map_err(map_err!(Stream)))
            .boxed())
    }
}

#[async_trait]
impl ChangeSubscriber for MongoBackend {
    async fn watch(&self, namespace: &Namespace) -> BackendResult<ChangeStream> {
        let stream = self
            .collection(namespace)
            .watch()
            .await
            .map_err(map_err!(Subscribe))?;

        Ok(stream
            .filter_map(|event| async move {
                match event {
                    // Events such as invalidate carry no namespace.
                    Ok(event) => event
                        .ns
                        .and_then(namespace_from_change)
                        .map(|ns| Ok(ChangeEvent::new(ns))),
                    Err(e) => Some(Err(BackendError::Stream(e.to_string()))),
                }
            })
            .boxed())
    }
}

/// Convert JSON stages (extended JSON allowed) into BSON documents.
pub fn to_documents(pipeline: &Pipeline) -> BackendResult<Vec<Document>> {
    pipeline
        .stages()
        .iter()
        .enumerate()
        .map(|(idx, stage)| match Bson::try_from(stage.clone()) {
            Ok(Bson::Document(doc)) => Ok(doc),
            Ok(other) => Err(BackendError::Pipeline(format!(
                "stage {idx} is a {:?}, not a document",
                other.element_type()
            ))),
            Err(e) => Err(BackendError::Pipeline(format!("stage {idx}: {e}"))),
        })
        .collect()
}

/// Flatten a result document into a record, keeping field order.
pub fn record_from_document(doc: &Document) -> ResultRecord {
    doc.iter()
        .map(|(key, value)| (key.as_str(), scalar_from_bson(value)))
        .collect()
}

fn scalar_from_bson(value: &Bson) -> Scalar {
    match value {
        Bson::Int32(v) => Scalar::Int32(*v),
        Bson::Int64(v) => Scalar::Int64(*v),
        Bson::Double(v) => Scalar::Double(*v),
        Bson::String(v) => Scalar::String(v.clone()),
        other => Scalar::Other(format!("{:?}", other.element_type()).to_lowercase()),
    }
}

fn namespace_from_change(ns: ChangeNamespace) -> Option<Namespace> {
    Some(Namespace::new(ns.db, ns.coll?))
}
