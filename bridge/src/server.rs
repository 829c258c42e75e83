use bridge_protocol::{FramingError, Response, Transport, codes};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;

pub async fn serve<R, W>(
    dispatcher: Arc<Dispatcher>,
    transport: &mut Transport<R, W>,
) -> Result<(), FramingError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = match transport.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("end of input");
                return Ok(());
            }
            Err(e) if e.is_io() => return Err(e),
            Err(e) => {
                warn!(error = %e, "failed to read message");
                if transport.mode().is_some() {
                    let reply = Response::err(None, codes::FRAMING_ERROR, e.to_string());
                    transport.write_message(&reply).await?;
                }
                continue;
            }
        };

        let id = message.get("id").filter(|v| !v.is_null()).cloned();
        let handler = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_message(message).await })
        };
        let reply = match handler.await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, id = ?id, "handler failed");
                id.map(|id| {
                    Response::err(Some(id), codes::HANDLER_FAILURE, format!("internal error: {e}"))
                })
            }
        };

        if let Some(reply) = reply {
            transport.write_message(&reply).await?;
        }
    }
}
