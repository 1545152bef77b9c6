//! Users example demonstrating a reactive query and a mutation.
//!
//! This example shows:
//! - A query whose key is a signal, refetched when the key changes
//! - Cached values shown while the next request is loading
//! - A mutation creating a new user
//! - Clearing every cache at once
//!
//! This uses `JSONPlaceholder` API (<https://jsonplaceholder.typicode.com/>) as a mock backend.
//!
//! Run with: `RUST_LOG=tears_query=debug cargo run --example users`

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tears_query::prelude::*;
use tracing_subscriber::EnvFilter;

/// A user from the API
#[derive(Debug, Clone, Deserialize)]
struct User {
    id: u32,
    name: String,
    email: String,
}

#[derive(Debug, Serialize)]
struct NewUser<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct Created {
    id: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = TransportConfig::new("https://jsonplaceholder.typicode.com/".parse()?)
        .with_header("accept", "application/json");
    let client = QueryClient::new(HttpTransport::new(&config)?);

    let key = Signal::new("users/1".to_string());
    let user = client.query(QueryOptions::<User>::new(&key));

    let status_log = watch(user.status(), |new, old, _| {
        println!("status: {old} -> {new}");
    });

    print_user(&user.settled().await);

    for id in [2, 1] {
        key.set(format!("users/{id}"));
        // Switching back to a known key shows the cached user right away.
        user.data()
            .wait_for(|data| data.as_ref().is_some_and(|r| r.data.id == id))
            .await;
        if user.snapshot().is_stale() {
            println!("showing cached user {id} while loading");
        }
        print_user(&user.settled().await);
    }

    let missing = client.query(QueryOptions::<User>::new("users/9999"));
    print_user(&missing.settled().await);

    let create = client.mutation(MutationOptions::<Created>::new("users"));
    let created = create
        .run(&NewUser {
            name: "Tears",
            email: "tears@example.com",
        })
        .await?;
    println!("created user {} (HTTP {})", created.data.id, created.status);

    clear_cache();
    println!(
        "cache cleared: {} entries left",
        client.cache::<User>().len()
    );

    status_log.cancel().await;
    Ok(())
}

fn print_user(result: &QueryResult<User>) {
    match (result.data(), &result.error) {
        (Some(user), None) => println!("user {}: {} <{}>", user.id, user.name, user.email),
        (Some(user), Some(err)) => println!("user {} (stale): {err}", user.id),
        (None, Some(err)) => println!("error: {err}"),
        (None, None) => println!("no data"),
    }
}
