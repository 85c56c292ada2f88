use std::env;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::constants::{PRO_API, UPLOAD_API, WEB_API};

static CUSTOM_WEB_API: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static CUSTOM_PRO_API: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static CUSTOM_UPLOAD_API: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

pub fn get_web_api() -> String {
    if let Some(url) = get_custom_web_api() {
        url
    } else {
        WEB_API.to_string()
    }
}

pub fn get_pro_api() -> String {
    if let Some(url) = get_custom_pro_api() {
        url
    } else {
        PRO_API.to_string()
    }
}

pub fn get_upload_api() -> String {
    if let Some(url) = get_custom_upload_api() {
        url
    } else {
        UPLOAD_API.to_string()
    }
}

fn get_custom_web_api() -> Option<String> {
    CUSTOM_WEB_API.lock().unwrap().clone()
}

pub fn set_custom_web_api(new_value: Option<String>) {
    let mut data = CUSTOM_WEB_API.lock().unwrap();
    *data = new_value;
}

fn get_custom_pro_api() -> Option<String> {
    CUSTOM_PRO_API.lock().unwrap().clone()
}

pub fn set_custom_pro_api(new_value: Option<String>) {
    let mut data = CUSTOM_PRO_API.lock().unwrap();
    *data = new_value;
}

fn get_custom_upload_api() -> Option<String> {
    CUSTOM_UPLOAD_API.lock().unwrap().clone()
}

pub fn set_custom_upload_api(new_value: Option<String>) {
    let mut data = CUSTOM_UPLOAD_API.lock().unwrap();
    *data = new_value;
}

/// Session cookies from the `PAN115_COOKIES` environment variable, with
/// `.env` files honored.
pub fn cookies_from_env() -> Option<String> {
    dotenv::dotenv().ok();
    env::var("PAN115_COOKIES").ok().filter(|s| !s.is_empty())
}
