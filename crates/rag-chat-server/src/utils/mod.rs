pub mod error;
pub mod sanitize;
pub mod similarity;

pub use sanitize::sanitize_message;
pub use similarity::cosine_similarity;
