//! Process-wide collaborators shared by stacks and accepters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::security::{CertStore, MockSecurity, SecurityProvider};
use crate::transport::{
    EchoFactory, MemBroker, MemFactory, SerialFactory, SerialSim, TcpFactory, TransportFactory,
};

struct EnvInner {
    transports: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
    security: RwLock<Arc<dyn SecurityProvider>>,
    certs: CertStore,
    serial: SerialSim,
    mem: MemBroker,
}

/// Transport registry, security provider and certificate store.
///
/// Cheap to clone; clones share state. Each `Env` has its own serial
/// simulator and `mem` broker, so independent environments never see each
/// other's devices or listeners.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// An environment with the built-in transports (`tcp`, `mem`,
    /// `serialdev`, `echo`) and the mock security provider.
    pub fn new() -> Self {
        let serial = SerialSim::new();
        let mem = MemBroker::new();
        let mut transports: HashMap<String, Arc<dyn TransportFactory>> = HashMap::new();
        transports.insert("tcp".into(), Arc::new(TcpFactory));
        transports.insert("mem".into(), Arc::new(MemFactory::new(mem.clone())));
        transports.insert("serialdev".into(), Arc::new(SerialFactory::new(serial.clone())));
        transports.insert("echo".into(), Arc::new(EchoFactory));
        Self {
            inner: Arc::new(EnvInner {
                transports: RwLock::new(transports),
                security: RwLock::new(Arc::new(MockSecurity)),
                certs: CertStore::new(),
                serial,
                mem,
            }),
        }
    }

    /// Add or replace a transport.
    pub fn register_transport(&self, name: &str, factory: Arc<dyn TransportFactory>) {
        self.inner
            .transports
            .write()
            .unwrap()
            .insert(name.to_string(), factory);
    }

    pub(crate) fn transport(&self, name: &str) -> Result<Arc<dyn TransportFactory>> {
        self.inner
            .transports
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown transport '{}'", name)))
    }

    pub fn is_transport(&self, name: &str) -> bool {
        self.inner.transports.read().unwrap().contains_key(name)
    }

    /// Engine source for the `ssl` layer.
    pub fn set_security_provider(&self, provider: Arc<dyn SecurityProvider>) {
        *self.inner.security.write().unwrap() = provider;
    }

    pub fn security_provider(&self) -> Arc<dyn SecurityProvider> {
        self.inner.security.read().unwrap().clone()
    }

    pub fn certs(&self) -> &CertStore {
        &self.inner.certs
    }

    pub fn serial_sim(&self) -> &SerialSim {
        &self.inner.serial
    }

    pub fn mem_broker(&self) -> &MemBroker {
        &self.inner.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_transports() {
        let env = Env::new();
        for name in ["tcp", "mem", "serialdev", "echo"] {
            assert!(env.is_transport(name), "{}", name);
        }
        assert!(matches!(env.transport("udp"), Err(Error::Config(_))));
        assert_eq!(env.security_provider().name(), "mock");
    }

    #[test]
    fn test_register_transport() {
        let env = Env::new();
        env.register_transport("loop", Arc::new(EchoFactory));
        assert!(env.transport("loop").is_ok());
        // Clones share the registry.
        assert!(env.clone().is_transport("loop"));
        assert!(!Env::new().is_transport("loop"));
    }
}
