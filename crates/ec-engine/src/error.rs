//! The engine's composed error type (§2.2 SUPPLEMENT): wraps the narrower
//! per-crate errors the lower layers return so callers of `read_block`/
//! `write_block` get one `Result` type.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ecal(#[from] ec_types::EcalError),

    #[error(transparent)]
    Codec(#[from] ec_codec::CodecError),

    #[error(transparent)]
    Transport(#[from] ec_transport::TransportError),

    #[error(transparent)]
    Pool(#[from] ec_pool::PoolError),
}
