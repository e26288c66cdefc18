use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Product {
    pub sku: &'static str,
    pub quizzes: u32,
    pub price_usd: f64,
    pub popular: bool,
}

impl Product {
    pub fn price_per_quiz(&self) -> f64 {
        self.price_usd / f64::from(self.quizzes)
    }
}

/// Token packs offered on the pricing screen.
pub static PRODUCTS: [Product; 3] = [
    Product {
        sku: "quiz_5",
        quizzes: 5,
        price_usd: 2.99,
        popular: false,
    },
    Product {
        sku: "quiz_20",
        quizzes: 20,
        price_usd: 7.99,
        popular: true,
    },
    Product {
        sku: "quiz_50",
        quizzes: 50,
        price_usd: 14.99,
        popular: false,
    },
];

pub fn find_product(sku: &str) -> Option<&'static Product> {
    PRODUCTS.iter().find(|product| product.sku == sku)
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCheckoutRequest {
    pub product_sku: String,
    pub device_id: String,
    pub success_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub checkout_id: String,
}

/// Wire shape of `GET /payment/success`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentStatusResponse {
    pub status: String,
    #[serde(default)]
    pub tokens_added: Option<u32>,
    #[serde(default)]
    pub tokens_remaining: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Pending,
    Completed,
    Failed,
}

/// One poll result, after mapping the wire status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPoll {
    Pending,
    Completed {
        tokens_added: u32,
        tokens_remaining: Option<u32>,
    },
}

impl From<PaymentStatusResponse> for PaymentPoll {
    fn from(resp: PaymentStatusResponse) -> Self {
        // Only "completed" is terminal; anything else keeps polling.
        if resp.status == "completed" {
            PaymentPoll::Completed {
                tokens_added: resp.tokens_added.unwrap_or(0),
                tokens_remaining: resp.tokens_remaining,
            }
        } else {
            PaymentPoll::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub checkout_id: String,
    pub status: CheckoutStatus,
}
