use serde_json::{Value, json};

use crate::page::{BoundingBox, Locator};

/// Attribute used to hand a resolved element over to CSS-addressed
/// protocol calls (click, focus, element screenshots).
pub const REF_ATTR: &str = "data-plan-runner-ref";

/// Query engine injected into the page.
///
/// Evaluates a serialized `LocatorSpec`:
///   - `label`: form controls whose `<label>`, `aria-label` or
///     `aria-labelledby` text matches.
///   - `placeholder`: elements whose placeholder matches.
///   - `text`: the innermost elements whose text content matches.
///   - `role`: elements with the implicit or explicit ARIA role whose
///     accessible name matches.
///   - `css`: `querySelectorAll`, with a trailing `:has-text('...')` filter.
///
/// Literal text compares as a case-insensitive substring after whitespace
/// normalization; patterns are compiled as `RegExp`.
const ENGINE_JS: &str = r#"
const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','TEMPLATE','HEAD']);
const ROLES = {
  button: 'button, input[type=button], input[type=submit], input[type=reset], [role=button]',
  link: 'a[href], area[href], [role=link]',
  textbox: 'input:not([type]), input[type=text], input[type=email], input[type=password], input[type=search], input[type=tel], input[type=url], input[type=number], textarea, [contenteditable=""], [contenteditable=true], [role=textbox]',
  combobox: 'select, input[list], [role=combobox]',
  checkbox: 'input[type=checkbox], [role=checkbox]',
  radio: 'input[type=radio], [role=radio]',
  heading: 'h1, h2, h3, h4, h5, h6, [role=heading]',
  tab: '[role=tab]',
  menuitem: '[role=menuitem]',
};
const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
function matches(text, m) {
  if (!m) return true;
  const t = norm(text);
  if (m.match === 'pattern') return new RegExp(m.source, m.ignore_case ? 'i' : '').test(t);
  return t.toLowerCase().includes(norm(m.value).toLowerCase());
}
function visible(el) {
  if (!el || !el.isConnected) return false;
  const s = getComputedStyle(el);
  if (s.display === 'none' || s.visibility === 'hidden') return false;
  const r = el.getBoundingClientRect();
  return r.width > 0 && r.height > 0;
}
function labels(el) {
  const out = [];
  if (el.labels) for (const l of el.labels) out.push(l.textContent);
  const aria = el.getAttribute('aria-label');
  if (aria) out.push(aria);
  const by = el.getAttribute('aria-labelledby');
  if (by) for (const id of by.split(/\s+/)) {
    const n = document.getElementById(id);
    if (n) out.push(n.textContent);
  }
  return out;
}
function accessibleName(el) {
  const l = labels(el);
  if (l.length) return l.join(' ');
  if (el.tagName === 'INPUT' && ['button','submit','reset'].includes(el.type)) return el.value || '';
  if (norm(el.textContent)) return el.textContent;
  return el.getAttribute('title') || el.getAttribute('placeholder') || '';
}
function all(sel) { return Array.from(document.querySelectorAll(sel)); }
function query(spec) {
  switch (spec.kind) {
    case 'label':
      return all('input, textarea, select, [contenteditable], [role=textbox], [role=combobox]')
        .filter(el => labels(el).some(t => matches(t, spec.text)));
    case 'placeholder':
      return all('[placeholder]').filter(el => matches(el.getAttribute('placeholder'), spec.text));
    case 'text': {
      const hits = all('body *').filter(el => !SKIP.has(el.tagName) && matches(el.textContent, spec.text));
      return hits.filter(el => !hits.some(o => o !== el && el.contains(o)));
    }
    case 'role': {
      const sel = ROLES[spec.role] || ('[role="' + spec.role + '"]');
      return all(sel)
        .filter(el => { const r = el.getAttribute('role'); return !r || r === spec.role; })
        .filter(el => matches(accessibleName(el), spec.name));
    }
    case 'css': {
      const m = spec.selector.match(/^(.*):has-text\((['"])(.*)\2\)\s*$/);
      if (m) return all(m[1]).filter(el => matches(el.textContent, { match: 'literal', value: m[3] }));
      return all(spec.selector);
    }
  }
  throw new Error('unknown locator kind: ' + spec.kind);
}
function pick(target) {
  const els = query(target.spec);
  if (target.nth === null || target.nth === undefined) return els;
  return els[target.nth] ? [els[target.nth]] : [];
}
function setValue(el, value) {
  el.focus();
  if (el.isContentEditable) {
    el.textContent = value;
  } else {
    const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
      : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
      : HTMLInputElement.prototype;
    const desc = Object.getOwnPropertyDescriptor(proto, 'value');
    if (desc && desc.set) desc.set.call(el, value); else el.value = value;
  }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
}
// Per-document network tracker. Counts fetch/XHR requests in flight and
// every resource entry seen, past the 250-entry default timing buffer.
function netTracker() {
  const key = '__plan_runner_net__';
  if (window[key]) return window[key];
  const t = { inflight: 0, resources: 0 };
  window[key] = t;
  if (performance.setResourceTimingBufferSize) performance.setResourceTimingBufferSize(100000);
  performance.addEventListener('resourcetimingbufferfull', () => performance.clearResourceTimings());
  try {
    new PerformanceObserver((list) => { t.resources += list.getEntries().length; })
      .observe({ type: 'resource', buffered: true });
  } catch (_) {
    t.resources = performance.getEntriesByType('resource').length;
  }
  const done = () => { t.inflight = Math.max(0, t.inflight - 1); };
  if (window.fetch) {
    const fetch = window.fetch;
    window.fetch = function (...args) {
      t.inflight += 1;
      return fetch.apply(this, args).finally(done);
    };
  }
  const send = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.send = function (...args) {
    t.inflight += 1;
    this.addEventListener('loadend', done, { once: true });
    return send.apply(this, args);
  };
  return t;
}
const OPS = {
  count: (a) => query(a.spec).length,
  state: (a) => { const el = pick(a.target)[0]; return { attached: !!el, visible: visible(el) }; },
  box: (a) => {
    const el = pick(a.target)[0];
    if (!el) return null;
    const r = el.getBoundingClientRect();
    return { x: r.x, y: r.y, width: r.width, height: r.height };
  },
  setValue: (a) => { const el = pick(a.target)[0]; if (!el) return false; setValue(el, a.value); return true; },
  mark: (a) => {
    const el = pick(a.target)[0];
    if (!el) return false;
    el.setAttribute(a.attr, a.token);
    el.scrollIntoView({ block: 'center', inline: 'center' });
    return true;
  },
  unmark: (a) => { for (const el of all('[' + a.attr + '="' + a.token + '"]')) el.removeAttribute(a.attr); return true; },
  pageSize: () => ({
    width: Math.max(document.documentElement.scrollWidth, document.body ? document.body.scrollWidth : 0),
    height: Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0),
  }),
  netTrack: () => { netTracker(); return true; },
  netStatus: () => {
    const t = netTracker();
    return { ready: document.readyState, inflight: t.inflight, resources: t.resources };
  },
};
"#;

/// Build a script that runs one engine op and returns
/// `JSON.stringify({ ok, value | error })`.
pub fn engine_call(op: &str, args: Value) -> String {
    format!(
        "(() => {{\n{ENGINE_JS}\ntry {{ return JSON.stringify({{ ok: true, value: OPS[{op}]({args}) }}); }}\ncatch (e) {{ return JSON.stringify({{ ok: false, error: String(e && e.message || e) }}); }}\n}})()",
        op = json!(op),
        args = args,
    )
}

pub fn target_args(locator: &Locator) -> Value {
    json!({ "target": locator })
}

/// Stops animations, transitions and the caret so screenshots are stable.
/// Idempotent per document.
pub const SUPPRESS_ANIMATIONS_JS: &str = r#"
(() => {
  const id = '__plan_runner_no_motion__';
  if (document.getElementById(id)) return;
  const style = document.createElement('style');
  style.id = id;
  style.textContent = `
    * { animation: none !important; transition: none !important; caret-color: transparent !important; }
    html, body { scroll-behavior: auto !important; }
  `;
  (document.head || document.documentElement).appendChild(style);
})()
"#;

/// Draw (or move) the fixed-position outline over `bbox`; it fades after 600ms.
pub fn overlay_script(bbox: &BoundingBox, color: &str) -> String {
    format!(
        r#"
(() => {{
  const b = {bbox};
  const color = {color};
  const id = '__plan_runner_highlight__';
  let el = document.getElementById(id);
  if (!el) {{
    el = document.createElement('div');
    el.id = id;
    Object.assign(el.style, {{
      position: 'fixed', zIndex: '2147483647', pointerEvents: 'none',
      borderRadius: '6px', transition: 'opacity 0.2s ease',
    }});
    document.body.appendChild(el);
  }}
  Object.assign(el.style, {{
    left: b.x + 'px', top: b.y + 'px', width: b.width + 'px', height: b.height + 'px',
    border: '3px solid ' + color, boxShadow: '0 0 10px ' + color, opacity: '1',
  }});
  setTimeout(() => {{ el.style.opacity = '0'; }}, 600);
}})()
"#,
        bbox = json!(bbox),
        color = json!(color),
    )
}
