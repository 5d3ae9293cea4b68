pub(crate) mod authority;
pub(crate) mod cache;
pub(crate) mod certificate;
pub(crate) mod key_pool;
pub(crate) mod keys;
pub(crate) mod manager;
