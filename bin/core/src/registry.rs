use rsgo_client::entities::registry::RegistryCredential;

use crate::docker::RegistryAuth;

/// Pick the credential for an image reference.
///
/// Ranking among matching patterns: most literal (non `*`)
/// characters first, then longest pattern, then earliest created
/// credential. Falls back to the default credential; `None` means
/// pull unauthenticated.
pub fn resolve_credential<'a>(
  reference: &str,
  credentials: &'a [RegistryCredential],
) -> Option<&'a RegistryCredential> {
  let normalized = normalize_reference(reference);

  let mut best: Option<(&RegistryCredential, usize, usize)> = None;
  for credential in credentials {
    for pattern in &credential.image_patterns {
      if !glob_match(pattern, &normalized) {
        continue;
      }
      let literals =
        pattern.chars().filter(|c| *c != '*').count();
      let length = pattern.len();
      let better = match best {
        None => true,
        Some((current, best_literals, best_length)) => {
          (literals, length, std::cmp::Reverse(credential.created_at))
            > (
              best_literals,
              best_length,
              std::cmp::Reverse(current.created_at),
            )
        }
      };
      if better {
        best = Some((credential, literals, length));
      }
    }
  }

  best
    .map(|(credential, _, _)| credential)
    .or_else(|| credentials.iter().find(|c| c.is_default))
}

/// The auth payload for a pull using this credential.
/// Anonymous credentials (no username) yield `None`.
pub fn auth_for(
  credential: &RegistryCredential,
  reference: &str,
) -> Option<RegistryAuth> {
  let username = credential.username.clone()?;
  let server_address = if credential.url.is_empty() {
    registry_host(&normalize_reference(reference)).to_string()
  } else {
    credential.url.clone()
  };
  Some(RegistryAuth {
    username,
    password: credential.secret.clone().unwrap_or_default(),
    server_address,
  })
}

/// Strip tag / digest and expand the implicit `docker.io/library/`
/// prefix for references with no registry host.
pub fn normalize_reference(reference: &str) -> String {
  // Digest comes after '@', tag after the last ':' past the
  // final '/' (a ':' before that is a registry port).
  let reference = match reference.split_once('@') {
    Some((name, _)) => name,
    None => reference,
  };
  let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
  let reference = match reference[last_slash..].find(':') {
    Some(colon) => &reference[..last_slash + colon],
    None => reference,
  };

  let first_segment =
    reference.split('/').next().unwrap_or_default();
  let has_host = first_segment.contains('.')
    || first_segment.contains(':')
    || first_segment == "localhost";

  if has_host {
    reference.to_string()
  } else if reference.contains('/') {
    format!("docker.io/{reference}")
  } else {
    format!("docker.io/library/{reference}")
  }
}

fn registry_host(normalized: &str) -> &str {
  normalized.split('/').next().unwrap_or_default()
}

/// `*` matches within one path segment, `**` matches one or more
/// whole segments.
fn glob_match(pattern: &str, reference: &str) -> bool {
  let pattern =
    pattern.split('/').collect::<Vec<_>>();
  let segments = reference.split('/').collect::<Vec<_>>();
  match_segments(&pattern, &segments)
}

fn match_segments(pattern: &[&str], segments: &[&str]) -> bool {
  let Some((head, rest)) = pattern.split_first() else {
    return segments.is_empty();
  };
  if *head == "**" {
    // One or more segments.
    (1..=segments.len())
      .any(|skip| match_segments(rest, &segments[skip..]))
  } else {
    segments.split_first().is_some_and(|(segment, remaining)| {
      segment_match(head, segment)
        && match_segments(rest, remaining)
    })
  }
}

/// Wildcard match within a single segment. `*` never crosses `/`
/// (the segment split already guarantees that).
fn segment_match(pattern: &str, value: &str) -> bool {
  if !pattern.contains('*') {
    return pattern == value;
  }
  let mut parts = pattern.split('*');
  let prefix = parts.next().unwrap_or_default();
  let Some(stripped) = value.strip_prefix(prefix) else {
    return false;
  };
  let mut remaining = stripped;
  let parts = parts.collect::<Vec<_>>();
  let count = parts.len();
  for (i, part) in parts.into_iter().enumerate() {
    if part.is_empty() {
      // Trailing '*' (or '**' collapsed inside a segment)
      // matches the rest.
      if i == count - 1 {
        return true;
      }
      continue;
    }
    if i == count - 1 {
      return remaining.ends_with(part);
    }
    match remaining.find(part) {
      Some(at) => remaining = &remaining[at + part.len()..],
      None => return false,
    }
  }
  true
}
