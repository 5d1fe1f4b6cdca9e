use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest as ShaDigest, Sha512};

use super::ProcessId;
use crate::consensus::peers::Peers;

pub type Digest = [u8; 64];

/*
    Signatures are the one piece of evidence a Byzantine process cannot
    fabricate for somebody else. Without them a certificate is only
    checked structurally (distinct senders, quorum size, deterministic
    reduction), so the validator takes the scheme through `Crypto` and a
    deployment chooses between `Unverified` and `Ed25519Crypto`.
*/

pub trait Crypto: Send + Sync {
    fn sign(&self, digest: &Digest) -> Signature;

    fn verify(&self, digest: &Digest, signature: &Signature, sender: ProcessId) -> bool;
}

pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pubkey {
    pub key: [u8; 32],
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Signature {
    pub signer: ProcessId,
    pub sig: [u8; 64],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Deterministic keypair, used by simulations that must replay exactly.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());

        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, signer: ProcessId, digest: &Digest) -> Signature {
        let sig = self.dalek_signer.sign(digest).to_bytes();

        Signature { signer, sig }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey.clone()
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        Pubkey { key: *bytes }
    }
}

impl Pubkey {
    pub fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        let Ok(dalek_pubkey) = VerifyingKey::from_bytes(&self.key) else {
            return false;
        };
        let dalek_sig = DalekSignature::from_bytes(&signature.sig);
        dalek_pubkey.verify_strict(digest, &dalek_sig).is_ok()
    }
}

impl Signature {
    /// Placeholder carried by messages when no signing scheme is configured.
    pub fn unsigned(signer: ProcessId) -> Self {
        Signature {
            signer,
            sig: [0u8; 64],
        }
    }
}

/// Structural-only validation: signs nothing and accepts every signature.
///
/// Certificates are still checked for quorum size, distinct senders and the
/// step reduction, but a Byzantine process can forge responses on behalf of
/// correct ones. Use [`Ed25519Crypto`] wherever that matters.
#[derive(Clone, Debug)]
pub struct Unverified {
    id: ProcessId,
}

impl Unverified {
    pub fn new(id: ProcessId) -> Self {
        Unverified { id }
    }
}

impl Crypto for Unverified {
    fn sign(&self, _digest: &Digest) -> Signature {
        Signature::unsigned(self.id)
    }

    fn verify(&self, _digest: &Digest, signature: &Signature, sender: ProcessId) -> bool {
        signature.signer == sender
    }
}

/// Ed25519 signatures checked against the membership key table.
pub struct Ed25519Crypto {
    id: ProcessId,
    keypair: Keypair,
    peers: Peers,
}

impl Ed25519Crypto {
    pub fn new(id: ProcessId, keypair: Keypair, peers: Peers) -> Self {
        Ed25519Crypto { id, keypair, peers }
    }
}

impl Crypto for Ed25519Crypto {
    fn sign(&self, digest: &Digest) -> Signature {
        self.keypair.sign(self.id, digest)
    }

    fn verify(&self, digest: &Digest, signature: &Signature, sender: ProcessId) -> bool {
        if signature.signer != sender {
            return false;
        }
        match self.peers.key(sender) {
            Some(pubkey) => pubkey.verify(digest, signature),
            None => false,
        }
    }
}

/// Incremental SHA-512 over length-delimited fields.
pub struct DigestBuilder {
    hasher: Sha512,
}

impl DigestBuilder {
    pub fn new(domain: &[u8]) -> Self {
        let mut builder = DigestBuilder {
            hasher: Sha512::new(),
        };
        builder.bytes(domain);
        builder
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_be_bytes());
        self
    }

    pub fn finish(&mut self) -> Digest {
        let result = self.hasher.finalize_reset();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::new_pair();
        let digest: Digest = [4; 64];
        let signature = keypair.sign(3, &digest);

        assert_eq!(signature.signer, 3);
        assert!(keypair.pubkey().verify(&digest, &signature));
    }

    #[test]
    fn test_ed25519_crypto_rejects_wrong_sender() {
        let keys: Vec<Keypair> = (0..4u8).map(|i| Keypair::from_seed([i + 1; 32])).collect();
        let peers = Peers::new(keys.iter().map(|k| k.pubkey()).collect());
        let digest: Digest = [9; 64];

        let signature = keys[1].sign(1, &digest);
        let crypto = Ed25519Crypto::new(0, Keypair::from_seed([1; 32]), peers);

        assert!(crypto.verify(&digest, &signature, 1));
        assert!(!crypto.verify(&digest, &signature, 2));
        assert!(!crypto.verify(&[8; 64], &signature, 1));

        // A signature re-labelled with somebody else's id fails against their key.
        let forged = Signature {
            signer: 2,
            sig: signature.sig,
        };
        assert!(!crypto.verify(&digest, &forged, 2));
    }

    #[test]
    fn test_unverified_only_checks_signer() {
        let crypto = Unverified::new(0);
        let signature = crypto.sign(&[1; 64]);

        assert_eq!(signature, Signature::unsigned(0));
        assert!(crypto.verify(&[2; 64], &signature, 0));
        assert!(!crypto.verify(&[2; 64], &signature, 1));
    }

    #[test]
    fn test_digest_is_length_delimited() {
        let a = DigestBuilder::new(b"t").bytes(b"ab").bytes(b"c").finish();
        let b = DigestBuilder::new(b"t").bytes(b"a").bytes(b"bc").finish();

        assert_ne!(a, b);
    }
}
