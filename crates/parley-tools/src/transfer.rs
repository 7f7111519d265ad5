//! Simulated money transfer. Sits behind the confirmation gate.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{Tool, ToolContext, ToolOutput};

pub struct TransferFundsTool;

#[derive(Deserialize)]
struct TransferParams {
    recipient: String,
    amount: f64,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    description: Option<String>,
}

fn default_currency() -> String {
    "USD".into()
}

#[async_trait]
impl Tool for TransferFundsTool {
    fn name(&self) -> &str {
        "transfer_funds"
    }

    fn description(&self) -> &str {
        "Transfer money to a recipient. The user must approve every transfer before it runs."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "recipient": { "type": "string", "description": "Who receives the money" },
                "amount": { "type": "number", "description": "Positive amount to send" },
                "currency": { "type": "string", "description": "ISO currency code (default: USD)" },
                "description": { "type": "string", "description": "Optional payment reference" }
            },
            "required": ["recipient", "amount"]
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let p: TransferParams = serde_json::from_value(params)?;
        if p.recipient.trim().is_empty() {
            anyhow::bail!("recipient must not be empty");
        }
        if !p.amount.is_finite() || p.amount <= 0.0 {
            anyhow::bail!("amount must be a positive number");
        }

        let transfer_id = format!("trf_{}", Uuid::new_v4().simple());
        info!(
            chat_id = %context.chat_id,
            user_id = %context.user_id,
            %transfer_id,
            amount = p.amount,
            currency = %p.currency,
            "Simulated transfer executed"
        );

        Ok(ToolOutput::text(
            json!({
                "status": "completed",
                "transfer_id": transfer_id,
                "recipient": p.recipient.trim(),
                "amount": p.amount,
                "currency": p.currency.to_uppercase(),
                "description": p.description,
            })
            .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ToolContext {
        ToolContext {
            chat_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            agent_key: "assistant".into(),
        }
    }

    #[tokio::test]
    async fn test_transfer_receipt() {
        let out = TransferFundsTool
            .execute(json!({"recipient": "X", "amount": 100, "currency": "eur"}), &context())
            .await
            .unwrap();
        let receipt: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(receipt["status"], "completed");
        assert_eq!(receipt["currency"], "EUR");
        assert!(receipt["transfer_id"].as_str().unwrap().starts_with("trf_"));
    }

    #[tokio::test]
    async fn test_rejects_bad_amounts() {
        let tool = TransferFundsTool;
        assert!(tool.requires_confirmation());
        assert!(tool.execute(json!({"recipient": "X", "amount": -5}), &context()).await.is_err());
        assert!(tool.execute(json!({"recipient": "", "amount": 5}), &context()).await.is_err());
        assert!(tool.execute(json!({"amount": 5}), &context()).await.is_err());
    }
}
