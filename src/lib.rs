pub mod daq;
pub mod device;
pub mod epoch;
pub mod io_data;
pub mod persist;
pub mod response;
pub mod settings;
pub mod stimulus;
pub mod streams;

pub use ephys_common::ConversionRegistry;
pub use ephys_common::Measurement;
pub use ephys_common::Value;
