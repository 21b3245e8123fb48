use std::fmt;

/// Which Binance deployment the live client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinanceEnvironment {
    #[default]
    Production,
    Testnet,
}

impl BinanceEnvironment {
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            Self::Production => "https://api.binance.com",
            Self::Testnet => "https://testnet.binance.vision",
        }
    }

    pub fn ws_base_url(&self) -> &'static str {
        match self {
            Self::Production => "wss://stream.binance.com:9443",
            Self::Testnet => "wss://testnet.binance.vision",
        }
    }

    /// Resolve from `BINANCE_ENVIRONMENT`; unset or unrecognised values fall
    /// back to production.
    pub fn from_env() -> Self {
        match std::env::var("BINANCE_ENVIRONMENT").as_deref() {
            Ok("testnet") | Ok("test") => Self::Testnet,
            _ => Self::Production,
        }
    }
}

impl fmt::Display for BinanceEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}
