//! Command-line driver over the ledger operations.

use std::str::FromStr;

use clap::{Parser, Subcommand};
use serde_json::{Value as JsonValue, json};

use fsv_entitlements::{CheckoutRequest, LedgerError, Product};

use crate::session::Session;

#[derive(Parser, Debug)]
#[command(name = "fsv-app")]
#[command(version)]
#[command(about = "Inspect and drive the story entitlement ledger", long_about = None)]
pub struct Cli {
    /// Defaults to `status` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn command(self) -> Command {
        self.command.unwrap_or(Command::Status)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the current subscription
    Status,

    /// Record a story that was already generated
    Consume,

    /// Buy a plan through the in-app purchase provider
    Purchase {
        /// Catalog id, e.g. fsv.family.yearly
        #[arg(value_parser = Product::from_str)]
        product: Product,
    },

    /// Recover an existing purchase
    Restore,

    /// List the plan catalog
    Products,

    /// Build the web checkout request for a plan
    Checkout {
        #[arg(value_parser = Product::from_str)]
        product: Product,

        /// App origin the checkout returns to
        base_url: String,
    },
}

/// Run one command and describe the result as JSON.
///
/// Ledger failures are reported in the output rather than aborting.
pub async fn run(session: &Session, command: Command) -> JsonValue {
    let ledger = session.ledger();

    let result: Result<JsonValue, LedgerError> = match command {
        Command::Status => Ok(json!({ "outcome": "status" })),
        Command::Consume => ledger.consume_story().await.map(|o| json!(o)),
        Command::Purchase { product } => ledger.purchase_subscription(product).await.map(|o| json!(o)),
        Command::Restore => ledger.restore_purchases().await.map(|o| json!(o)),
        Command::Products => return products_json(),
        Command::Checkout { product, base_url } => {
            return json!(CheckoutRequest::for_product(product, &base_url));
        }
    };

    let mut output = match result {
        Ok(outcome) => outcome,
        Err(err) => json!({
            "error": err.to_string(),
            "userMessage": err.user_message(),
        }),
    };

    output["subscription"] = json!(ledger.snapshot());
    output["canCreateStory"] = json!(ledger.can_create_story());
    output["needsPaywall"] = json!(ledger.needs_paywall());
    output["storiesRemaining"] = json!(ledger.remaining_credits());
    output
}

fn products_json() -> JsonValue {
    let products: Vec<JsonValue> = Product::ALL
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id(),
                "title": p.title(),
                "price": p.display_price(),
                "period": p.period_label(),
                "savings": p.savings_label(),
                "features": p.features(),
                "popular": p.is_popular(),
            })
        })
        .collect();
    json!({ "products": products })
}
