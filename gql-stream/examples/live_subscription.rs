//! Live subscription example
//!
//! Subscribes to a GraphQL endpoint speaking `graphql-ws` and prints every
//! response until the server completes the stream or Ctrl-C is pressed.
//!
//! ```text
//! cargo run -p gql-sdk-stream --example live_subscription -- \
//!     ws://localhost:4000/graphql 'subscription { ticks { at } }'
//! ```
//!
//! The endpoint may also come from `GQL_ENDPOINT` and a bearer token from
//! `GQL_TOKEN`. Set `GQL_LOG_MODE=development` to see lifecycle logs.

use std::sync::Arc;

use gql_stream::logging::init_logging_from_env;
use gql_stream::{
    EventKind, Request, SubscriptionConfig, Subscription, WebSocketConfig, WebSocketProvider,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .or_else(|| std::env::var("GQL_ENDPOINT").ok())
        .unwrap_or_else(|| "ws://localhost:4000/graphql".to_string());
    let query = args
        .next()
        .unwrap_or_else(|| "subscription { ticks { at } }".to_string());

    println!("Subscribing to {}", endpoint);
    println!("  {}", query);

    let mut request = Request::new(query);
    if let Ok(token) = std::env::var("GQL_TOKEN") {
        request = request.with_header("Authorization", format!("Bearer {}", token));
    }

    let config = SubscriptionConfig::terminate_on_connection_terminate();
    let subscription = Subscription::with_config(request, config)?;

    subscription.on(EventKind::ConnectionAck, |_event| async {
        println!("Connection acknowledged");
        Ok(())
    });
    subscription.on_data(|response| async move {
        match response.data() {
            Some(data) => println!("data: {}", data),
            None => println!("data frame without data"),
        }
        for error in response.errors() {
            println!("  graphql error: {}", error.message);
        }
        Ok(())
    });
    subscription.on_error(|response| async move {
        println!("error: {}", response.json());
        Ok(())
    });
    subscription.on(EventKind::ConnectionError, |event| async move {
        println!("connection error: {}", event.json());
        Ok(())
    });

    let provider = WebSocketProvider::with_config(
        WebSocketConfig::default().with_connect_timeout(std::time::Duration::from_secs(10)),
    );
    subscription.subscribe(endpoint, Arc::new(provider), false);

    tokio::select! {
        state = subscription.wait_finished() => {
            println!("Subscription ended: {}", state);
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, sending stop");
            if let Some(outcome) = subscription.unsubscribe_and_wait().await {
                println!("Session {}", outcome);
            }
        }
    }

    Ok(())
}
