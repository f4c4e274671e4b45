//! Production `EngineClient` backed by a `tonic` channel to the build
//! engine's streaming RPC.

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use super::{BuildInvocation, BuildOutcome, CONTEXT_CANCELED_MARKER, EngineClient};
use crate::util::Error;

pub mod proto {
    tonic::include_proto!("buildctl.engine");
}

use proto::build_engine_client::BuildEngineClient as RawClient;
use proto::build_event::Event;
use proto::result::Outcome;

pub struct GrpcEngineClient {
    client: RawClient<Channel>,
}

impl GrpcEngineClient {
    pub async fn connect(endpoint: String) -> Result<Self, Error> {
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| Error::InvalidInput(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        Ok(GrpcEngineClient {
            client: RawClient::new(channel),
        })
    }
}

#[async_trait]
impl EngineClient for GrpcEngineClient {
    async fn build(&self, invocation: BuildInvocation, cancel: CancellationToken) -> Result<BuildOutcome, Error> {
        let request = proto::BuildRequest {
            context_url: invocation.context_url,
            images: invocation.images,
            build_args: invocation.build_args.into_iter().collect(),
            disable_cache: invocation.disable_cache,
            auth_dir: invocation.auth_dir,
            secrets: invocation.secrets.into_iter().collect(),
        };

        let mut client = self.client.clone();
        let call = client.build(request);

        let response = tokio::select! {
            result = call => result,
            _ = cancel.cancelled() => {
                return Err(Error::Transient(CONTEXT_CANCELED_MARKER.to_string()));
            }
        };
        let mut stream = response.map_err(Error::from)?.into_inner();

        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => {
                    return Err(Error::Transient(CONTEXT_CANCELED_MARKER.to_string()));
                }
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(status)) => return Err(status.into()),
                None => return Err(Error::Transient("build engine closed the stream without a result".to_string())),
            };
            match event.event {
                Some(Event::Progress(_)) => continue,
                Some(Event::Result(result)) => {
                    return match result.outcome {
                        Some(Outcome::Success(success)) => Ok(BuildOutcome {
                            image_size: success.image_size,
                        }),
                        Some(Outcome::Error(message)) => Err(Error::Fatal(message)),
                        None => Err(Error::Transient("build engine sent an empty result".to_string())),
                    };
                }
                None => continue,
            }
        }
    }
}
