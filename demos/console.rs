//! Interactive demo: a processor consuming an HTTP message source.
//!
//! Starts the source on a local port, then reads lines from stdin and
//! POSTs each one as a JSON message to the running listener. Type `stop`
//! to shut everything down.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{prelude::*, EnvFilter};
use uuid::Uuid;

use inlet::{HttpMessageSourceBuilder, ProcessMessage, Processor};

const SOURCE_URL: &str = "http://127.0.0.1:6007";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SampleMessage {
    id: Uuid,
    message: String,
}

struct PrintingHandler;

#[async_trait::async_trait]
impl ProcessMessage<SampleMessage> for PrintingHandler {
    type Error = std::convert::Infallible;

    async fn process(
        &mut self,
        message: SampleMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        println!(
            "processed: id=[{}] message=[{}]",
            message.id, message.message
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let source = HttpMessageSourceBuilder::<SampleMessage>::new()
        .listen_on(SOURCE_URL)?
        .build()?;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(Processor::new(source, PrintingHandler).run(cancel.clone()));

    let client = reqwest::Client::new();
    let stdin = std::io::stdin();

    println!("Listening on {SOURCE_URL}. Enter messages to send (\"stop\" to quit):");

    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("stop") {
            println!("Stopping...");
            cancel.cancel();
            break;
        }

        let message = SampleMessage {
            id: Uuid::new_v4(),
            message: line,
        };
        println!(
            "sending: id=[{}] message=[{}]",
            message.id, message.message
        );
        client
            .post(SOURCE_URL)
            .json(&message)
            .send()
            .await?
            .error_for_status()?;
    }

    run.await??;
    Ok(())
}
