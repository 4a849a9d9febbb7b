pub mod config {
    pub mod settings;
}
pub mod db {
    pub mod position_store;
    pub mod redis;
}
pub mod services {
    pub mod scheduler;
    pub mod trading_engine;
    pub mod position_desk;
    pub mod position;

    pub mod indicators;
    pub mod trailing;
    pub mod risk;

    pub mod exchange;
    pub mod blowfin {
        pub mod api;
        pub mod auth;
        pub mod client;
    }
    pub mod strategies {
        pub mod common;
        pub use common::{Candle, OrderSide, Side};
        pub mod divergence;
        pub use divergence::{DivergenceConfig, DivergenceSignal};
    }
}

pub mod utils {
    pub mod errors;
}
