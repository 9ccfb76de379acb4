//! Demo server: wires a small `Users` service and serves it.

use std::sync::Arc;

use serde_json::json;
use switchboard::{
    server, Dispatcher, MethodKind, ProcedureDefinition, ProcedureHandler, RuntimeConfig, Schema,
    SchemaRegistry, ServiceDefinition, ServiceImplementationBuilder,
};

fn users_definition() -> ServiceDefinition {
    ServiceDefinition::new("Users")
        .with_procedure(ProcedureDefinition::new(
            "GetUser",
            "fetch one user by id",
            MethodKind::Query,
            Schema::object([("id", Schema::string(), true)]),
            Schema::object([("id", Schema::string(), true), ("name", Schema::string(), true)]),
        ))
        .with_procedure(ProcedureDefinition::new(
            "StreamName",
            "push each letter of a name as its own frame",
            MethodKind::Subscription,
            Schema::object([("name", Schema::string_bounded(Some(1), None), true)]),
            Schema::object([("letter", Schema::string(), true)]),
        ))
        .with_procedure(ProcedureDefinition::new(
            "Echo",
            "echo every inbound message back",
            MethodKind::Bidirectional,
            Schema::object([("text", Schema::string(), true)]),
            Schema::object([("echo", Schema::string(), true)]),
        ))
}

fn users_implementation(
    definition: Arc<ServiceDefinition>,
) -> anyhow::Result<switchboard::ServiceImplementation> {
    let implementation = ServiceImplementationBuilder::new(definition)
        .handler(
            "GetUser",
            ProcedureHandler::query(|input, _info, _ctx| async move {
                let id = input
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(json!({"id": id, "name": "Demo User"}))
            }),
        )
        .handler(
            "StreamName",
            ProcedureHandler::subscription(|input, _info, _ctx, connection| async move {
                let name = input
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                for letter in name.chars() {
                    connection.write(&json!({"letter": letter.to_string()}));
                }
                connection.close();
                Ok(())
            }),
        )
        .handler(
            "Echo",
            ProcedureHandler::bidirectional(|_input, _info, _ctx, connection| async move {
                let sender = Arc::clone(&connection);
                connection.add_message_listener("echo", move |_conn, message| {
                    let sender = Arc::clone(&sender);
                    async move {
                        let text = message
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        sender.send_message(&json!({"echo": text}));
                        Ok(())
                    }
                });
                connection.add_close_listener(|reason| async move {
                    tracing::info!(reason = reason.as_deref().unwrap_or("none"), "echo closed");
                    Ok(())
                });
                Ok(())
            }),
        )
        .build()?;
    Ok(implementation)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchboard=debug".into()),
        )
        .init();

    let config = RuntimeConfig::load()?;

    let definition = users_definition();
    let mut registry = SchemaRegistry::new();
    registry.register_service(definition.clone());

    let implementation = users_implementation(Arc::new(definition))?;

    let mut dispatcher = Dispatcher::new(registry, config.keepalive_interval());
    dispatcher.implement("Users", implementation);

    server::serve(Arc::new(dispatcher), config).await
}
