mod buffer2;
mod single_flight;

pub use buffer2::Buffer2;
pub use single_flight::SingleFlight;
