// 认证模块

pub mod token_manager;
pub mod types;

pub use token_manager::TokenManager;
pub use types::{LoginData, LoginRequest, LoginResponse};
