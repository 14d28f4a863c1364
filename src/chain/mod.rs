pub mod fetcher;
pub mod head;
