//! Renders object templates into concrete manifests.
//!
//! Rendering is pure: no network, no filesystem. Random helpers draw from a
//! PRNG seeded by (uuid, job, iteration, replica) so reruns under the same
//! UUID reproduce prior output byte for byte.
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use thiserror::Error;

/// Errors produced while rendering a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Syntax error, missing variable or helper failure.
    #[error("template error: {0}")]
    Render(#[from] minijinja::Error),
}

/// Per-instance rendering context.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Run UUID.
    pub uuid: &'a str,
    /// Name of the job the instance belongs to.
    pub job_name: &'a str,
    /// Iteration index, 1-based.
    pub iteration: u32,
    /// Replica index within the iteration, 1-based.
    pub replica: u32,
    /// Free variables from the object entry.
    pub input_vars: &'a BTreeMap<String, serde_json::Value>,
}

impl RenderContext<'_> {
    fn seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.uuid.hash(&mut hasher);
        self.job_name.hash(&mut hasher);
        self.iteration.hash(&mut hasher);
        self.replica.hash(&mut hasher);
        hasher.finish()
    }
}

/// Render one template into a manifest payload.
///
/// On error no payload is produced, never a partial substitution.
pub fn render(template: &str, ctx: &RenderContext) -> Result<Vec<u8>, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    install_helpers(&mut env, ctx.seed());
    env.add_template("object", template)?;
    let tmpl = env.get_template("object")?;

    let mut scope: BTreeMap<String, Value> = ctx
        .input_vars
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_serializable(v)))
        .collect();
    // Builtins win over input vars on collision
    scope.insert("UUID".to_owned(), Value::from(ctx.uuid));
    scope.insert("JobName".to_owned(), Value::from(ctx.job_name));
    scope.insert("Iteration".to_owned(), Value::from(ctx.iteration));
    scope.insert("Replica".to_owned(), Value::from(ctx.replica));

    let rendered = tmpl.render(Value::from_serializable(&scope))?;
    Ok(rendered.into_bytes())
}

fn install_helpers(env: &mut Environment<'_>, seed: u64) {
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));

    let rand_int = rng.clone();
    env.add_function(
        "randInt",
        move |min: i64, max: i64| -> Result<i64, minijinja::Error> {
            if min > max {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("randInt: min {min} greater than max {max}"),
                ));
            }
            let mut rng = rand_int.lock().expect("should be able to acquire lock");
            Ok(rng.gen_range(min..=max))
        },
    );

    let rand_string = rng;
    env.add_function(
        "randString",
        move |len: usize| -> Result<String, minijinja::Error> {
            let mut bytes = vec![0u8; len.div_ceil(2)];
            let mut rng = rand_string.lock().expect("should be able to acquire lock");
            rng.fill_bytes(&mut bytes);
            let mut s = hex::encode(bytes);
            s.truncate(len);
            Ok(s)
        },
    );

    env.add_function(
        "sequence",
        |start: i64, end: i64| -> Result<Value, minijinja::Error> {
            if start > end {
                return Err(minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("sequence: start {start} greater than end {end}"),
                ));
            }
            Ok(Value::from((start..=end).collect::<Vec<i64>>()))
        },
    );

    env.add_function("envVar", |name: &str| -> String {
        std::env::var(name).unwrap_or_default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ JobName }}-{{ Iteration }}-{{ Replica }}
spec:
  replicas: {{ podReplicas }}
  template:
    spec:
      containers:
        - name: {{ JobName }}
          image: {{ image }}
"#;

    fn ctx<'a>(vars: &'a BTreeMap<String, serde_json::Value>) -> RenderContext<'a> {
        RenderContext {
            uuid: "1f8e",
            job_name: "api-intensive",
            iteration: 2,
            replica: 1,
            input_vars: vars,
        }
    }

    #[test]
    fn renders_builtins_and_input_vars() {
        let vars = BTreeMap::from_iter(vec![
            ("podReplicas".to_owned(), serde_json::json!(3)),
            ("image".to_owned(), serde_json::json!("quay.io/test/pause")),
        ]);
        let payload = render(DEPLOYMENT, &ctx(&vars)).unwrap();
        let rendered = String::from_utf8(payload).unwrap();
        assert!(rendered.contains("name: api-intensive-2-1"));
        assert!(rendered.contains("replicas: 3"));
        assert!(rendered.contains("image: quay.io/test/pause"));
    }

    #[test]
    fn renders_complete_manifest() {
        let vars = BTreeMap::from_iter(vec![
            ("podReplicas".to_owned(), serde_json::json!(3)),
            ("image".to_owned(), serde_json::json!("quay.io/test/pause")),
        ]);
        let payload = render(DEPLOYMENT, &ctx(&vars)).unwrap();
        expect_test::expect![[r#"
            apiVersion: apps/v1
            kind: Deployment
            metadata:
              name: api-intensive-2-1
            spec:
              replicas: 3
              template:
                spec:
                  containers:
                    - name: api-intensive
                      image: quay.io/test/pause
        "#]]
        .assert_eq(&String::from_utf8(payload).unwrap());
    }

    #[test]
    fn rendering_is_deterministic() {
        let vars = BTreeMap::new();
        let template = "name: {{ JobName }}-{{ randString(8) }}-{{ randInt(0, 1000) }}";
        let first = render(template, &ctx(&vars)).unwrap();
        let second = render(template, &ctx(&vars)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_replicas_draw_different_randomness() {
        let vars = BTreeMap::new();
        let template = "{{ randString(16) }}";
        let one = render(
            template,
            &RenderContext {
                replica: 1,
                ..ctx(&vars)
            },
        )
        .unwrap();
        let two = render(
            template,
            &RenderContext {
                replica: 2,
                ..ctx(&vars)
            },
        )
        .unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn missing_variable_fails_without_output() {
        let vars = BTreeMap::new();
        let err = render("image: {{ image }}", &ctx(&vars)).unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn unknown_helper_fails() {
        let vars = BTreeMap::new();
        assert!(render("{{ lookup('x') }}", &ctx(&vars)).is_err());
    }

    #[test]
    fn sequence_expands_in_loops() {
        let vars = BTreeMap::new();
        let rendered = render(
            "{% for i in sequence(1, 3) %}{{ i }},{% endfor %}",
            &ctx(&vars),
        )
        .unwrap();
        assert_eq!(String::from_utf8(rendered).unwrap(), "1,2,3,");
    }

    #[test]
    fn rand_int_respects_bounds() {
        let vars = BTreeMap::new();
        for _ in 0..10 {
            let rendered = render("{{ randInt(5, 7) }}", &ctx(&vars)).unwrap();
            let value: i64 = String::from_utf8(rendered).unwrap().parse().unwrap();
            assert!((5..=7).contains(&value));
        }
        assert!(render("{{ randInt(7, 5) }}", &ctx(&vars)).is_err());
    }

    #[test]
    fn builtins_shadow_input_vars() {
        let vars = BTreeMap::from_iter(vec![(
            "UUID".to_owned(),
            serde_json::json!("spoofed"),
        )]);
        let rendered = render("{{ UUID }}", &ctx(&vars)).unwrap();
        assert_eq!(String::from_utf8(rendered).unwrap(), "1f8e");
    }
}
