pub mod admission;

pub use admission::{Admission, AdmissionRequest, Credentials, GatewayAdmissionController};
