pub mod object_store;
pub mod odometer;
pub mod replica_manager;
pub mod storage_service;

pub use object_store::ObjectStore;
pub use odometer::Odometer;
pub use replica_manager::ReplicaManager;
pub use storage_service::LocalObjectStore;
