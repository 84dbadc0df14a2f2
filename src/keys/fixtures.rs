// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Keys generated with OpenSSL and OpenSSH. Encrypted keys use the
//! passphrase `secret` and, apart from the OpenSSH one, hold the same key as
//! their plain counterparts.

use secrecy::SecretString;

pub(crate) struct Fixture {
    pub(crate) name: &'static str,
    pub(crate) pem: &'static str,
    pub(crate) public: &'static str,
    pub(crate) encrypted: bool,
}

impl Fixture {
    /// The base64 key blob from the `.pub` line.
    pub(crate) fn blob(&self) -> &'static str {
        self.public.split_whitespace().nth(1).unwrap_or_default()
    }

    pub(crate) fn passphrase(&self) -> SecretString {
        SecretString::new(if self.encrypted { "secret" } else { "" }.to_owned())
    }
}

pub(crate) const FIXTURES: &[Fixture] = &[
    Fixture {
        name: "rsa",
        pem: include_str!("testdata/rsa_plain.pem"),
        public: include_str!("testdata/rsa_plain.pub"),
        encrypted: false,
    },
    Fixture {
        name: "rsa, encrypted",
        pem: include_str!("testdata/rsa_encrypted.pem"),
        public: include_str!("testdata/rsa_plain.pub"),
        encrypted: true,
    },
    Fixture {
        name: "ec",
        pem: include_str!("testdata/ec_plain.pem"),
        public: include_str!("testdata/ec_plain.pub"),
        encrypted: false,
    },
    Fixture {
        name: "ec, encrypted",
        pem: include_str!("testdata/ec_encrypted.pem"),
        public: include_str!("testdata/ec_plain.pub"),
        encrypted: true,
    },
    Fixture {
        name: "pkcs8",
        pem: include_str!("testdata/pkcs8_plain.pem"),
        public: include_str!("testdata/pkcs8_plain.pub"),
        encrypted: false,
    },
    Fixture {
        name: "pkcs8, encrypted",
        pem: include_str!("testdata/pkcs8_encrypted.pem"),
        public: include_str!("testdata/pkcs8_plain.pub"),
        encrypted: true,
    },
    Fixture {
        name: "openssh",
        pem: include_str!("testdata/openssh_plain.pem"),
        public: include_str!("testdata/openssh_plain.pub"),
        encrypted: false,
    },
    Fixture {
        name: "openssh, encrypted",
        pem: include_str!("testdata/openssh_encrypted.pem"),
        public: include_str!("testdata/openssh_encrypted.pub"),
        encrypted: true,
    },
];
