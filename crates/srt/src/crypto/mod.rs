// src/crypto/mod.rs
//! Key-material negotiation and per-packet payload protection.
//!
//! The configured passphrase never travels: a PBKDF2-derived key-encryption
//! key wraps the randomly drawn session keys (RFC 3394), and the wrapped
//! material rides in `KMREQ`/`KMRSP` blocks. Payloads are encrypted in
//! place with AES-CTR keyed by the even/odd session key named in the
//! packet's encryption-flags bits.

pub mod keywrap;

use crate::packet::KeySpec;
use crate::seq::SeqNo;
use bytes::Bytes;
use keywrap::AesKey;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Negotiation state of one transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmState {
    /// Neither side wants encryption.
    Unsecured,
    /// Key material is being exchanged.
    Securing,
    /// Keys agreed; payloads are protected.
    Secured,
    /// The peer encrypts but no passphrase is configured here.
    NoSecret,
    /// Passphrases do not match; payloads stay opaque.
    BadSecret,
}

impl KmState {
    fn code(self) -> u32 {
        match self {
            KmState::Unsecured => 0,
            KmState::Securing => 1,
            KmState::Secured => 2,
            KmState::NoSecret => 3,
            KmState::BadSecret => 4,
        }
    }

    fn from_code(code: u32) -> KmState {
        match code {
            1 => KmState::Securing,
            2 => KmState::Secured,
            3 => KmState::NoSecret,
            4 => KmState::BadSecret,
            _ => KmState::Unsecured,
        }
    }
}

/// Why a payload could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    /// No session key installed for the parity named in the packet.
    NoKey,
}

const KM_VERSION_PT: u8 = 0x12;
const KM_SIGN: [u8; 2] = [0x20, 0x29];
const KM_CIPHER_AES_CTR: u8 = 2;
const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 2048;
/// How many times an unanswered KM message is re-sent.
const KM_MAX_RETRY: i32 = 10;
const KM_RESEND_PERIOD: Duration = Duration::from_secs(1);

fn kk_code(parity: KeySpec) -> u8 {
    match parity {
        KeySpec::Even => 1,
        KeySpec::Odd => 2,
        KeySpec::Clear => 0,
    }
}

fn parity_index(parity: KeySpec) -> usize {
    match parity {
        KeySpec::Even => 0,
        KeySpec::Odd => 1,
        KeySpec::Clear => 0,
    }
}

fn derive_kek(passphrase: &str, salt: &[u8], key_len: usize) -> AesKey {
    let mut kek = vec![0u8; key_len];
    pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut kek);
    AesKey::new(&kek).expect("validated key length")
}

/// Builds the wire form of a KM message carrying one wrapped session key.
fn build_km_msg(parity: KeySpec, key_len: usize, salt: &[u8; 16], wrapped: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(8 + SALT_LEN + wrapped.len());
    out.push(KM_VERSION_PT);
    out.extend_from_slice(&KM_SIGN);
    out.push(kk_code(parity));
    out.push(KM_CIPHER_AES_CTR);
    out.push(0);
    out.push((key_len / 4) as u8);
    out.push(SALT_LEN as u8);
    out.extend_from_slice(salt);
    out.extend_from_slice(wrapped);
    Bytes::from(out)
}

struct KmMsgParsed<'a> {
    parity: KeySpec,
    key_len: usize,
    salt: &'a [u8],
    wrapped: &'a [u8],
}

fn parse_km_msg(data: &[u8]) -> Option<KmMsgParsed<'_>> {
    if data.len() < 8 + SALT_LEN || data[0] != KM_VERSION_PT || data[1..3] != KM_SIGN {
        return None;
    }
    let parity = match data[3] {
        1 => KeySpec::Even,
        2 => KeySpec::Odd,
        _ => return None,
    };
    if data[4] != KM_CIPHER_AES_CTR {
        return None;
    }
    let key_len = data[6] as usize * 4;
    if !matches!(key_len, 16 | 24 | 32) || data[7] as usize != SALT_LEN {
        return None;
    }
    let salt = &data[8..8 + SALT_LEN];
    let wrapped = &data[8 + SALT_LEN..];
    if wrapped.len() != key_len + 8 {
        return None;
    }
    Some(KmMsgParsed {
        parity,
        key_len,
        salt,
        wrapped,
    })
}

/// Four-byte failure KMRSP carrying a [`KmState`] code.
fn km_error_rsp(state: KmState) -> Bytes {
    Bytes::from(state.code().to_be_bytes().to_vec())
}

struct PendingKm {
    msg: Bytes,
    retries_left: i32,
    last_send: Option<Instant>,
}

/// Per-connection crypto engine: owns the send keys (two parities during
/// rotation), the receive keys installed from the peer's KM messages, and
/// the negotiation state of both directions.
pub struct CryptoControl {
    passphrase: Option<String>,
    key_len: usize,
    km_refresh_rate: u64,
    km_preannounce: u64,

    // Sender half.
    snd_salt: [u8; SALT_LEN],
    snd_sek: [Option<Vec<u8>>; 2],
    active_parity: KeySpec,
    pending_km: [Option<PendingKm>; 2],
    pkts_since_switch: u64,
    regen_armed: bool,
    /// True on the side that generated the keys; only it drives rekeys.
    rekey_owner: bool,
    pub snd_state: KmState,
    pub snd_peer_state: KmState,

    // Receiver half.
    rcv_sek: [Option<Vec<u8>>; 2],
    rcv_salt: [u8; SALT_LEN],
    pub rcv_state: KmState,
}

impl CryptoControl {
    pub fn new(
        passphrase: Option<String>,
        key_len: usize,
        km_refresh_rate: u64,
        km_preannounce: u64,
    ) -> Self {
        let key_len = if key_len == 0 { 16 } else { key_len };
        Self {
            passphrase,
            key_len,
            km_refresh_rate,
            km_preannounce,
            snd_salt: [0; SALT_LEN],
            snd_sek: [None, None],
            active_parity: KeySpec::Even,
            pending_km: [None, None],
            pkts_since_switch: 0,
            regen_armed: false,
            rekey_owner: false,
            snd_state: KmState::Unsecured,
            snd_peer_state: KmState::Unsecured,
            rcv_sek: [None, None],
            rcv_salt: [0; SALT_LEN],
            rcv_state: KmState::Unsecured,
        }
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// True when outgoing payloads are encrypted.
    pub fn snd_active(&self) -> bool {
        self.snd_sek[parity_index(self.active_parity)].is_some()
    }

    /// Aggregate state reported by the stats/option surface.
    pub fn km_state(&self) -> KmState {
        if self.snd_state != KmState::Unsecured {
            if self.snd_peer_state != KmState::Unsecured
                && self.snd_peer_state != KmState::Secured
            {
                return self.snd_peer_state;
            }
            return self.snd_state;
        }
        self.rcv_state
    }

    /// Prepares the initial send key. Called by the handshake initiator
    /// (and by an HSv4-style pure sender) before attaching `KMREQ`.
    pub fn init_sender(&mut self) {
        if self.passphrase.is_none() {
            return;
        }
        let mut rng = rand::rng();
        rng.fill_bytes(&mut self.snd_salt);
        let mut sek = vec![0u8; self.key_len];
        rng.fill_bytes(&mut sek);

        let parity = KeySpec::Even;
        let Some(msg) = self.wrap_into_msg(parity, &sek) else {
            return;
        };
        self.snd_sek[parity_index(parity)] = Some(sek);
        self.active_parity = parity;
        self.pending_km[parity_index(parity)] = Some(PendingKm {
            msg,
            retries_left: KM_MAX_RETRY,
            last_send: None,
        });
        self.rekey_owner = true;
        self.snd_state = KmState::Securing;
        self.snd_peer_state = KmState::Securing;
    }

    fn wrap_into_msg(&self, parity: KeySpec, sek: &[u8]) -> Option<Bytes> {
        let passphrase = self.passphrase.as_deref()?;
        let kek = derive_kek(passphrase, &self.snd_salt, self.key_len);
        let wrapped = keywrap::wrap(&kek, sek);
        Some(build_km_msg(parity, self.key_len, &self.snd_salt, &wrapped))
    }

    /// The KM message to attach to a CONCLUSION handshake, when any.
    pub fn kmreq_for_handshake(&self) -> Option<Bytes> {
        self.pending_km[parity_index(self.active_parity)]
            .as_ref()
            .map(|p| p.msg.clone())
    }

    /// Responder side of the exchange. Unwraps the peer's session key and
    /// produces the KMRSP payload (an exact echo on success, a four-byte
    /// state code on failure). With `bidirectional` set (HSv5), the
    /// initiator's key is cloned for the reverse direction.
    pub fn process_kmreq(&mut self, data: &[u8], bidirectional: bool) -> Bytes {
        let Some(msg) = parse_km_msg(data) else {
            warn!("Malformed KMREQ ({} bytes)", data.len());
            self.rcv_state = KmState::BadSecret;
            return km_error_rsp(KmState::BadSecret);
        };
        let Some(passphrase) = self.passphrase.clone() else {
            debug!("Peer declares encryption but no passphrase is set");
            self.rcv_state = KmState::NoSecret;
            return km_error_rsp(KmState::NoSecret);
        };

        let kek = derive_kek(&passphrase, msg.salt, msg.key_len);
        match keywrap::unwrap(&kek, msg.wrapped) {
            Some(sek) => {
                self.rcv_salt.copy_from_slice(msg.salt);
                self.rcv_sek[parity_index(msg.parity)] = Some(sek.clone());
                self.rcv_state = KmState::Secured;
                if bidirectional {
                    // Clone the initiator's context for our send direction:
                    // same SEK, same salt, no separate exchange. Any key
                    // material prepared locally is superseded.
                    self.key_len = msg.key_len;
                    self.snd_salt.copy_from_slice(msg.salt);
                    self.snd_sek = [None, None];
                    self.snd_sek[parity_index(msg.parity)] = Some(sek);
                    self.active_parity = msg.parity;
                    self.pending_km = [None, None];
                    self.rekey_owner = false;
                    self.snd_state = KmState::Secured;
                    self.snd_peer_state = KmState::Secured;
                }
                debug!("KMREQ accepted, receive direction secured");
                Bytes::copy_from_slice(data)
            }
            None => {
                debug!("KMREQ unwrap failed: passphrase mismatch");
                self.rcv_state = KmState::BadSecret;
                km_error_rsp(KmState::BadSecret)
            }
        }
    }

    /// Initiator side: matches a KMRSP against the outstanding KM message.
    pub fn process_kmrsp(&mut self, data: &[u8]) -> KmState {
        if data.len() == 4 {
            let code = u32::from_be_bytes(data.try_into().unwrap());
            let state = KmState::from_code(code);
            debug!("KMRSP carries failure state {:?}", state);
            self.snd_peer_state = state;
            return state;
        }
        let mut matched = false;
        for pending in self.pending_km.iter_mut().flatten() {
            if pending.msg.as_ref() == data {
                pending.retries_left = 0;
                matched = true;
            }
        }
        if matched {
            self.snd_state = KmState::Secured;
            self.snd_peer_state = KmState::Secured;
            // Bidirectional context: the peer sends back under the same
            // SEK, so it doubles as our receive key.
            self.rcv_salt = self.snd_salt;
            for i in 0..2 {
                if self.rcv_sek[i].is_none() {
                    self.rcv_sek[i] = self.snd_sek[i].clone();
                }
            }
            self.rcv_state = KmState::Secured;
            debug!("KMRSP matched, send direction secured");
            KmState::Secured
        } else {
            warn!("KMRSP does not match any outstanding KM message");
            self.snd_peer_state
        }
    }

    /// Periodic retry of unanswered KM messages.
    pub fn km_to_send(&mut self, now: Instant) -> Option<Bytes> {
        for pending in self.pending_km.iter_mut().flatten() {
            if pending.retries_left <= 0 {
                continue;
            }
            let due = match pending.last_send {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= KM_RESEND_PERIOD,
            };
            if due {
                pending.retries_left -= 1;
                pending.last_send = Some(now);
                return Some(pending.msg.clone());
            }
        }
        None
    }

    /// Marks the handshake-borne KMREQ as already answered (HSv5 attaches
    /// the response to the handshake itself).
    pub fn km_handshake_done(&mut self) {
        for pending in self.pending_km.iter_mut().flatten() {
            pending.retries_left = 0;
        }
    }

    fn ctr_iv(salt: &[u8; SALT_LEN], seq: SeqNo) -> [u8; 16] {
        let mut iv = *salt;
        let seq_bytes = seq.raw().to_be_bytes();
        for (i, b) in seq_bytes.iter().enumerate() {
            iv[12 + i] ^= b;
        }
        iv
    }

    fn ctr_xor(key: &[u8], iv: &[u8; 16], data: &mut [u8]) {
        use ctr::cipher::{KeyIvInit, StreamCipher};
        type Ctr128<T> = ctr::Ctr128BE<T>;
        use aes::cipher::generic_array::GenericArray;
        match key.len() {
            16 => Ctr128::<aes::Aes128>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )
            .apply_keystream(data),
            24 => Ctr128::<aes::Aes192>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )
            .apply_keystream(data),
            32 => Ctr128::<aes::Aes256>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            )
            .apply_keystream(data),
            _ => {}
        }
    }

    /// Encrypts a payload in place under the active send key. Returns the
    /// key spec the packet must carry, or `Clear` when encryption is off.
    pub fn encrypt(&mut self, seq: SeqNo, payload: &mut [u8]) -> KeySpec {
        let parity = self.active_parity;
        let Some(sek) = &self.snd_sek[parity_index(parity)] else {
            return KeySpec::Clear;
        };
        let iv = Self::ctr_iv(&self.snd_salt, seq);
        Self::ctr_xor(sek, &iv, payload);
        parity
    }

    /// Decrypts a payload in place with the key named by `kk`.
    pub fn decrypt(
        &self,
        kk: KeySpec,
        seq: SeqNo,
        payload: &mut [u8],
    ) -> Result<(), DecryptError> {
        if kk == KeySpec::Clear {
            return Ok(());
        }
        let Some(sek) = &self.rcv_sek[parity_index(kk)] else {
            return Err(DecryptError::NoKey);
        };
        let iv = Self::ctr_iv(&self.rcv_salt, seq);
        Self::ctr_xor(sek, &iv, payload);
        Ok(())
    }

    /// Accounts one sent data packet; drives key rotation. At the refresh
    /// boundary the other parity key is generated and announced; after the
    /// pre-announce span the sender switches over to it.
    pub fn on_data_sent(&mut self) {
        if self.snd_state != KmState::Secured || self.km_refresh_rate == 0 || !self.rekey_owner {
            return;
        }
        self.pkts_since_switch += 1;
        if !self.regen_armed && self.pkts_since_switch >= self.km_refresh_rate {
            let next = match self.active_parity {
                KeySpec::Even => KeySpec::Odd,
                _ => KeySpec::Even,
            };
            let mut sek = vec![0u8; self.key_len];
            rand::rng().fill_bytes(&mut sek);
            let Some(msg) = self.wrap_into_msg(next, &sek) else {
                return;
            };
            self.snd_sek[parity_index(next)] = Some(sek);
            self.pending_km[parity_index(next)] = Some(PendingKm {
                msg,
                retries_left: KM_MAX_RETRY,
                last_send: None,
            });
            self.regen_armed = true;
            debug!("Rekey: generated {:?} session key", next);
        } else if self.regen_armed
            && self.pkts_since_switch >= self.km_refresh_rate + self.km_preannounce
        {
            self.active_parity = match self.active_parity {
                KeySpec::Even => KeySpec::Odd,
                _ => KeySpec::Even,
            };
            self.pkts_since_switch = 0;
            self.regen_armed = false;
            debug!("Rekey: switched to {:?} key", self.active_parity);
        }
    }

    #[cfg(test)]
    pub fn active_parity(&self) -> KeySpec {
        self.active_parity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(pass: &str) -> CryptoControl {
        let mut c = CryptoControl::new(Some(pass.into()), 16, 0, 0);
        c.init_sender();
        c
    }

    #[test]
    fn matching_passphrases_secure_both_directions() {
        let mut snd = sender("s!t@r#i$c^t");
        let mut rcv = CryptoControl::new(Some("s!t@r#i$c^t".into()), 16, 0, 0);

        let kmreq = snd.kmreq_for_handshake().unwrap();
        let kmrsp = rcv.process_kmreq(&kmreq, true);
        assert_eq!(rcv.rcv_state, KmState::Secured);
        assert_eq!(rcv.snd_state, KmState::Secured);
        assert_eq!(kmrsp, kmreq);

        assert_eq!(snd.process_kmrsp(&kmrsp), KmState::Secured);
        assert_eq!(snd.km_state(), KmState::Secured);
        assert_eq!(rcv.km_state(), KmState::Secured);
    }

    #[test]
    fn encrypt_then_decrypt_recovers_payload() {
        let mut snd = sender("0123456789");
        let mut rcv = CryptoControl::new(Some("0123456789".into()), 16, 0, 0);
        let kmreq = snd.kmreq_for_handshake().unwrap();
        rcv.process_kmreq(&kmreq, false);

        let seq = SeqNo::new(777);
        let original = b"live payload bytes".to_vec();
        let mut buf = original.clone();
        let kk = snd.encrypt(seq, &mut buf);
        assert_eq!(kk, KeySpec::Even);
        assert_ne!(buf, original);

        rcv.decrypt(kk, seq, &mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn mismatched_passphrase_is_badsecret() {
        let mut snd = sender("s!t@r#i$c^t");
        let mut rcv = CryptoControl::new(Some("s!t@r#i$c^tu".into()), 16, 0, 0);

        let kmreq = snd.kmreq_for_handshake().unwrap();
        let kmrsp = rcv.process_kmreq(&kmreq, true);
        assert_eq!(rcv.rcv_state, KmState::BadSecret);
        assert_eq!(kmrsp.len(), 4);

        assert_eq!(snd.process_kmrsp(&kmrsp), KmState::BadSecret);
        assert_eq!(snd.km_state(), KmState::BadSecret);
        assert_eq!(rcv.km_state(), KmState::BadSecret);

        // No key installed: decrypt must fail, leaving flags in place.
        let mut buf = b"opaque".to_vec();
        assert_eq!(
            rcv.decrypt(KeySpec::Even, SeqNo::new(1), &mut buf),
            Err(DecryptError::NoKey)
        );
    }

    #[test]
    fn missing_passphrase_is_nosecret() {
        let mut snd = sender("0123456789");
        let mut rcv = CryptoControl::new(None, 0, 0, 0);
        let kmreq = snd.kmreq_for_handshake().unwrap();
        let kmrsp = rcv.process_kmreq(&kmreq, false);
        assert_eq!(rcv.rcv_state, KmState::NoSecret);
        assert_eq!(snd.process_kmrsp(&kmrsp), KmState::NoSecret);
    }

    #[test]
    fn rekey_switches_parity_after_preannounce() {
        let mut snd = CryptoControl::new(Some("0123456789".into()), 16, 10, 4);
        snd.init_sender();
        let mut rcv = CryptoControl::new(Some("0123456789".into()), 16, 0, 0);
        let kmreq = snd.kmreq_for_handshake().unwrap();
        let kmrsp = rcv.process_kmreq(&kmreq, false);
        snd.process_kmrsp(&kmrsp);
        assert_eq!(snd.active_parity(), KeySpec::Even);

        for _ in 0..10 {
            snd.on_data_sent();
        }
        // Refresh hit: the odd key exists and is announced, even still active.
        let announce = snd.km_to_send(Instant::now()).unwrap();
        rcv.process_kmreq(&announce, false);
        assert_eq!(snd.active_parity(), KeySpec::Even);

        for _ in 0..4 {
            snd.on_data_sent();
        }
        assert_eq!(snd.active_parity(), KeySpec::Odd);

        // Traffic under the odd key decrypts with the announced key.
        let seq = SeqNo::new(42);
        let original = b"after rekey".to_vec();
        let mut buf = original.clone();
        let kk = snd.encrypt(seq, &mut buf);
        assert_eq!(kk, KeySpec::Odd);
        rcv.decrypt(kk, seq, &mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn km_retries_are_bounded() {
        let mut snd = sender("0123456789");
        let mut now = Instant::now();
        let mut sends = 0;
        for _ in 0..20 {
            if snd.km_to_send(now).is_some() {
                sends += 1;
            }
            now += KM_RESEND_PERIOD;
        }
        assert_eq!(sends, KM_MAX_RETRY);
    }
}
