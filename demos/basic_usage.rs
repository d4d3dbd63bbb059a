//! Basic usage example for aduket

use aduket::MockServer;
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Start a mock server on an ephemeral port
    let server = MockServer::spawn().await?;
    println!("Mock server listening on {}", server.url().unwrap_or_default());

    // Register expectations
    server
        .expect("GET", "/users")
        .json_body(&json!([{"id": 1, "name": "ismail"}]));
    server
        .expect("POST", "/users")
        .status(201)
        .header("Location", "/users/2")
        .times(1);
    server
        .expect("GET", "/slow")
        .delay(Duration::from_millis(250))
        .response(200, "finally");

    // Print every captured exchange
    server.on_exchange(|exchange| {
        println!(
            "  -> {} {} [{}]",
            exchange.method,
            exchange.uri,
            exchange.status_code
        );
    });

    // Exercise it like the system under test would
    let client = reqwest::Client::new();
    let base = server.url().unwrap_or_default();

    println!("\nSending requests...");
    let users = client.get(format!("{base}/users")).send().await?.text().await?;
    println!("  GET /users body: {users}");

    let created = client
        .post(format!("{base}/users"))
        .json(&json!({"name": "aduket"}))
        .send()
        .await?;
    println!("  POST /users status: {}", created.status());

    let missing = client.get(format!("{base}/nothing")).send().await?;
    println!("  GET /nothing status: {}", missing.status());

    // Inspect and verify
    println!("\nRecorded: {}", server.request_count());
    server.check_body_json(1, &json!({"name": "aduket"}))?;

    match server.try_verify() {
        Ok(()) => println!("All expectations met"),
        Err(e) => println!("\n{e}"),
    }

    server.close();
    Ok(())
}
