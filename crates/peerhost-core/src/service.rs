//! The invocation surface shared by single pipelines, pools and [`PeerHost`](crate::PeerHost).

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::request::{InvocationRequest, StreamSource};
use crate::transport::ByteStream;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Invokes functions in peer processes.
///
/// The `invoke_from_*` methods are conveniences over the four core methods.
#[async_trait]
pub trait InvocationService: Send + Sync {
    /// Invoke and decode the result.
    async fn invoke<T>(&self, request: InvocationRequest, cancel: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static;

    /// Invoke, returning `None` when the peer has no cached module for the
    /// request.
    async fn try_invoke<T>(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static;

    /// Invoke and return the raw response body.
    async fn invoke_stream(
        &self,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;

    /// Invoke and discard the result.
    async fn invoke_void(&self, request: InvocationRequest, cancel: &CancellationToken)
        -> Result<()>;

    /// Replace the current peer process (every peer for a pool).
    async fn replace_peer(&self) -> Result<()>;

    /// Stop watching, kill peers and refuse further invocations.
    async fn dispose(&self);

    async fn invoke_from_file<T>(
        &self,
        module_path: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = with_call(InvocationRequest::from_file(module_path)?, None, export_name, args);
        self.invoke(request, cancel).await
    }

    async fn invoke_from_string<T>(
        &self,
        module_source: &str,
        cache_identifier: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = with_call(
            InvocationRequest::from_string(module_source)?,
            cache_identifier,
            export_name,
            args,
        );
        self.invoke(request, cancel).await
    }

    async fn invoke_from_stream<T>(
        &self,
        stream: StreamSource,
        cache_identifier: Option<&str>,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = with_call(
            InvocationRequest::from_stream(stream),
            cache_identifier,
            export_name,
            args,
        );
        self.invoke(request, cancel).await
    }

    async fn try_invoke_from_cache<T>(
        &self,
        cache_identifier: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = with_call(
            InvocationRequest::from_cache(cache_identifier)?,
            None,
            export_name,
            args,
        );
        self.try_invoke(request, cancel).await
    }

    /// Invoke a cached module, sending the source produced by `module_source`
    /// (and caching it) only when the peer does not have it yet.
    async fn invoke_from_string_cached<T, F>(
        &self,
        module_source: F,
        cache_identifier: &str,
        export_name: Option<&str>,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce() -> String + Send + 'static,
    {
        if let Some(result) = self
            .try_invoke_from_cache(cache_identifier, export_name, args.clone(), cancel)
            .await?
        {
            return Ok(result);
        }

        let source = module_source();
        self.invoke_from_string(&source, Some(cache_identifier), export_name, args, cancel)
            .await
    }
}

fn with_call(
    mut request: InvocationRequest,
    cache_identifier: Option<&str>,
    export_name: Option<&str>,
    args: Vec<Value>,
) -> InvocationRequest {
    if let Some(cache_identifier) = cache_identifier {
        request = request.with_cache_identifier(cache_identifier);
    }
    if let Some(export_name) = export_name {
        request = request.with_export_name(export_name);
    }
    request.with_args(args)
}
