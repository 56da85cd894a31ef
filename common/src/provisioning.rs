//! Provisioning-mode request handling shared by the host and ESP servers.

use serde::Deserialize;
use thiserror::Error;

use crate::{
    medium::PersistentMedium,
    store::{ConfigurationRecord, ConfigurationStore, StoreError},
};

pub const FORM_PATH: &str = "/postform/";
pub const METHOD_NOT_ALLOWED: &str = "Method Not Allowed";
pub const SAVED_MESSAGE: &str =
    "Object configuration successfully saved. Please, reset to continue";

pub const FORM_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>
body { font-family: 'Roboto', sans-serif; }
.form-row { display: flex; }
label { width: 100%; }
article {
    background-color: white;
    width: 280px;
    padding: 50px;
    margin: auto;
    box-shadow: 0px -2px 20px 2px rgba(0, 0, 0, 0.4);
}
.inputs { border-radius: 7px; padding: 5px; margin: 2px; }
</style>
</head>
<body>
<article>
<form method="post" enctype="application/x-www-form-urlencoded" action="/postform/">
    <h1>Object Repository</h1>
    <h3>WiFi Credentials</h3>
    <p>Enter the SSID and the password used to reach the Internet</p>
    <div class="form-row">
        <label for="ssid">SSID:</label>
        <input class="inputs" type="text" id="ssid" name="ssid">
    </div>
    <div class="form-row">
        <label for="password">Password:</label>
        <input class="inputs" type="password" id="password" name="password">
    </div>
    <h3>Blinds identification</h3>
    <p>A short description of the object, such as <em>Kitchen</em></p>
    <div class="form-row">
        <label for="name">Name:</label>
        <input class="inputs" type="text" id="name" name="name" value="Kitchen">
    </div>
    <p>Your router will also list this device under that name</p>
    <h3>MQTT message broker</h3>
    <p>Only change these when debugging</p>
    <div class="form-row">
        <label for="mqtt_server">URI:</label>
        <input class="inputs" type="text" id="mqtt_server" name="mqtt_server" value="test.mosquitto.org">
    </div>
    <div class="form-row">
        <label for="mqtt_port">Port:</label>
        <input class="inputs" type="text" id="mqtt_port" name="mqtt_port" value="1883">
    </div>
    <br/>
    <input type="submit" value="Save to EEPROM">
</form>
</article>
</body>
</html>
"#;

/// Fields posted by the provisioning form. Missing fields arrive empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProvisioningForm {
    pub ssid: String,
    pub password: String,
    pub name: String,
    pub mqtt_server: String,
    pub mqtt_port: String,
}

impl ProvisioningForm {
    pub fn from_urlencoded(body: &[u8]) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_bytes(body)
    }

    pub fn to_record(&self) -> ConfigurationRecord {
        let mut record = ConfigurationRecord::new();
        record.set_ssid(&self.ssid);
        record.set_password(&self.password);
        record.set_name(&self.name);
        record.set_mqtt_server(&self.mqtt_server);
        record.set_mqtt_port(&self.mqtt_port);
        record
    }
}

/// Persists a submitted form as a fresh record and returns the response body.
pub fn apply_form<M: PersistentMedium>(
    store: &mut ConfigurationStore<M>,
    form: &ProvisioningForm,
) -> Result<String, StoreError> {
    store.replace_record(form.to_record());
    store.save()?;
    Ok(format!("{SAVED_MESSAGE}\n{}", store.describe()))
}

#[derive(Debug, Error)]
pub enum FormError {
    #[error("malformed form body: {0}")]
    Decode(#[from] serde_urlencoded::de::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decodes a urlencoded form body and persists it. A body that does not
/// decode leaves the store untouched.
pub fn apply_form_body<M: PersistentMedium>(
    store: &mut ConfigurationStore<M>,
    body: &[u8],
) -> Result<String, FormError> {
    let form = ProvisioningForm::from_urlencoded(body)?;
    Ok(apply_form(store, &form)?)
}

/// Splits a raw request URI into its path and decoded query arguments.
/// An undecodable query yields no arguments.
pub fn split_query(uri: &str) -> (&str, Vec<(String, String)>) {
    match uri.split_once('?') {
        Some((path, query)) => (path, serde_urlencoded::from_str(query).unwrap_or_default()),
        None => (uri, Vec::new()),
    }
}

pub fn not_found_body(uri: &str, method: &str, args: &[(String, String)]) -> String {
    let mut body = format!(
        "File Not Found\n\nURI: {uri}\nMethod: {method}\nArguments: {}\n",
        args.len()
    );
    for (name, value) in args {
        body.push_str(&format!(" {name}: {value}\n"));
    }
    body
}
